// Prompt constants for the analytics query pipeline.
// Templates use `{placeholder}` markers that are replaced before sending.

/// System prompt for SQL generation.
pub const SQL_SYSTEM: &str = "You are a PostgreSQL expert for a campus placement portal. \
    You translate questions into a single read-only SELECT statement. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

/// Schema description shown to the model. Secret and moderation columns are omitted.
pub const DATABASE_SCHEMA: &str = r#"TABLES:

students:
  - id (text, primary key)
  - user_id (text, foreign key to user.id)
  - email (text)
  - name (text)
  - srn (text)
  - phone (text)
  - cgpa (text) - student's current CGPA
  - degree (text) - BTech, MTech, MCA
  - course (text) - CSE, ECE, EEE, AIML
  - skills (jsonb) - array of skill objects with {skill, proficiency}
  - certifications (jsonb) - array of certification objects
  - experience (jsonb) - array of experience objects
  - resumes (jsonb) - array of resume objects
  - status (text) - pending, approved, rejected
  - created_at (timestamp)

companies:
  - id (text, primary key)
  - user_id (text, foreign key to user.id)
  - name (text)
  - email (text)
  - industry (text)
  - size (text)
  - location (text)
  - website (text)
  - status (text) - pending, approved, rejected
  - created_at (timestamp)

jobs:
  - id (text, primary key)
  - company_id (text, foreign key to companies.id)
  - title (text)
  - description (text)
  - type (text) - intern, full-time
  - location (text)
  - cgpa_cutoff (text) - minimum CGPA required
  - eligible_courses (jsonb) - array of allowed courses
  - eligible_degrees (jsonb) - array of allowed degrees
  - salary (text) - salary in INR
  - skills (jsonb) - required skills array
  - benefits (jsonb) - benefits array
  - status (text) - active, closed
  - analytics (jsonb) - {views: number, applications: number}
  - created_at (timestamp)

applications:
  - id (text, primary key)
  - job_id (text, foreign key to jobs.id)
  - student_id (text, foreign key to students.id)
  - status (text) - pending, oa, interview, selected, rejected
  - student_cgpa (text) - CGPA at time of application
  - student_course (text) - course at time of application
  - student_degree (text) - degree at time of application
  - applied_at (timestamp)

user (always quote as "user"):
  - id (text, primary key)
  - name (text)
  - email (text)
  - role (text) - student, company, admin
  - created_at (timestamp)

NOTES:
- JSONB arrays are expanded with jsonb_array_elements() / jsonb_array_elements_text() in FROM
- jsonb_array_length() counts array elements
- cgpa, cgpa_cutoff and salary are TEXT; cast to NUMERIC before comparing
- All timestamps are UTC
- Use PostgreSQL syntax (ILIKE for case-insensitive search, || for concatenation)"#;

/// SQL generation prompt. Replace `{role}`, `{allowed_tables}`, `{schema}`,
/// `{question}`, `{retry_section}` and `{untrusted_input}` before sending.
pub const SQL_PROMPT_TEMPLATE: &str = r#"Convert the question below into one PostgreSQL SELECT query.

USER ROLE: {role}
ALLOWED TABLES: {allowed_tables}

DATABASE SCHEMA:
{schema}

QUESTION: "{question}"
{retry_section}
REQUIREMENTS:
1. Return exactly one SELECT statement. It must start with SELECT (no WITH prefix, no semicolons, no comments).
2. Only use tables from ALLOWED TABLES. Reference them without a schema prefix.
3. Never use SELECT * or table.*; name every column you return.
4. Expand JSONB arrays with jsonb_array_elements / jsonb_array_elements_text and count them with jsonb_array_length.
5. Cast cgpa, cgpa_cutoff and salary to NUMERIC before comparing (salary may look like "X LPA" or "X-Y LPA").
6. Rows are already limited to what this user may see; do NOT add WHERE clauses for the current user, student or company.
7. Give every table an alias and qualify every column with it.
8. For a single number return one row with a column named "value" and optionally "label".
9. Limit list results to a reasonable size (top 10 or top 20).
10. If the question is not about the placement data, return an empty "sql" string and answer in "explanation".

{untrusted_input}

Return a JSON object with this EXACT schema:
{
  "sql": "SELECT ...",
  "explanation": "Plain English explanation of what the query does",
  "chartType": "bar | line | pie | radar | table | metric | funnel",
  "visualization": {
    "xAxis": "column for the x-axis (optional)",
    "yAxis": "column for the y-axis (optional)",
    "groupBy": "column to group by (optional)"
  }
}"#;

/// Appended on the corrective attempt. Replace `{previous_sql}` and `{error_message}`.
pub const RETRY_SECTION_TEMPLATE: &str = r#"
PREVIOUS ATTEMPT FAILED.
The query below was rejected by the database:
{previous_sql}

Database error: {error_message}

Fix the error and return a corrected query. Keep the same intent.
"#;

/// Insights prompt. Replace `{question}`, `{chart_type}`, `{rows}` and `{row_note}`.
pub const INSIGHTS_PROMPT_TEMPLATE: &str = r#"Analyze the following query result and provide 3-5 key insights.

ORIGINAL QUESTION: "{question}"
CHART TYPE: {chart_type}
DATA: {rows} {row_note}

Insights must be:
1. Actionable and specific
2. Focused on important patterns or trends
3. Written in a friendly, professional tone
4. Relevant to the person who asked

Format the insights as markdown bullet points, at most 200 words.

Return a JSON object: {"insights": "markdown formatted insights"}"#;

/// General-question prompt. Replace `{role}`, `{question}` and `{untrusted_input}`.
pub const GENERAL_PROMPT_TEMPLATE: &str = r#"You are the analytics assistant of a campus placement portal.
The user ({role}) asked something that is not a data query:

"{question}"

Answer briefly and helpfully in at most 120 words of markdown. If the question could be answered
from placement data, suggest how to phrase it as a data question (counts, trends, top-10 lists).
Never invent statistics.

{untrusted_input}

Return a JSON object: {"answer": "markdown answer"}"#;

/// Follow-up suggestions prompt. Replace `{role}` and `{recent_queries}`.
pub const SUGGESTIONS_PROMPT_TEMPLATE: &str = r#"Suggest 3-5 follow-up analytics questions for a {role} on a campus placement portal.

RECENT QUESTIONS: {recent_queries}

Each suggestion must be a natural-language question answerable from students, companies, jobs
and applications data that this role may see.

Return a JSON object: {"suggestions": ["question 1", "question 2"]}"#;
