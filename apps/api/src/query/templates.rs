//! Pre-canned analytics questions, one set per role.
//!
//! A template fixes both the prompt sent to the model and the chart type of
//! the result; the caller only picks it by id.

use serde::Serialize;

use crate::access::policy::Role;
use crate::models::query::ChartType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTemplate {
    pub id: &'static str,
    pub role: Role,
    pub category: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub prompt: &'static str,
    pub chart_type: ChartType,
    pub sort_order: u32,
}

#[allow(clippy::too_many_arguments)]
const fn template(
    id: &'static str,
    role: Role,
    category: &'static str,
    name: &'static str,
    description: &'static str,
    prompt: &'static str,
    chart_type: ChartType,
    sort_order: u32,
) -> QueryTemplate {
    QueryTemplate {
        id,
        role,
        category,
        name,
        description,
        prompt,
        chart_type,
        sort_order,
    }
}

pub static TEMPLATES: &[QueryTemplate] = &[
    template(
        "student-cgpa-compare",
        Role::Student,
        "Profile Analysis",
        "How does my CGPA compare?",
        "See where your CGPA ranks among all students",
        "Calculate my CGPA percentile ranking among all students. Show total students, my CGPA, average CGPA, and my percentile rank.",
        ChartType::Metric,
        1,
    ),
    template(
        "student-skills-demand",
        Role::Student,
        "Market Insights",
        "Most in-demand skills",
        "Skills most frequently required in job postings",
        "Analyze all active jobs and show the top 10 most frequently required skills with their count.",
        ChartType::Bar,
        2,
    ),
    template(
        "student-application-success",
        Role::Student,
        "Application Stats",
        "My application success rate",
        "Breakdown of your application statuses",
        "Show distribution of my application statuses (pending, oa, interview, selected, rejected) with counts and percentages.",
        ChartType::Pie,
        3,
    ),
    template(
        "student-profile-strength",
        Role::Student,
        "Profile Analysis",
        "My profile strength analysis",
        "Multi-dimensional view of your profile competitiveness",
        "Compare my profile across multiple dimensions: CGPA percentile, number of skills vs average, number of certifications vs average, years of experience vs average, and number of applications. Return scores from 0-100 for each dimension.",
        ChartType::Radar,
        4,
    ),
    template(
        "student-job-matches",
        Role::Student,
        "Job Recommendations",
        "Best job matches for me",
        "Jobs that match your profile and eligibility",
        "Find active jobs I'm eligible for based on my CGPA, degree, and course. Calculate match score based on my skills overlap with job requirements. Show top 10 matches with company name, job title, salary, and match percentage.",
        ChartType::Table,
        5,
    ),
    template(
        "student-application-trends",
        Role::Student,
        "Application Stats",
        "My application timeline",
        "Track when you applied to jobs over time",
        "Show my applications over time, grouped by week for the last 2 months. Include total applications per week.",
        ChartType::Line,
        6,
    ),
    template(
        "company-application-stats",
        Role::Company,
        "Hiring Analytics",
        "Application statistics overview",
        "Overall stats for all your job postings",
        "Summarize application statistics across all my jobs: total jobs posted, total applications, average applications per job, applications by status (pending/oa/interview/selected/rejected), and average CGPA of applicants.",
        ChartType::Metric,
        1,
    ),
    template(
        "company-cgpa-distribution",
        Role::Company,
        "Applicant Insights",
        "Applicant CGPA distribution",
        "Distribution of applicant CGPAs across your jobs",
        "Show CGPA distribution of all applicants to my jobs. Group by CGPA ranges: <6.0, 6.0-7.0, 7.0-8.0, 8.0-9.0, >9.0 with counts.",
        ChartType::Bar,
        2,
    ),
    template(
        "company-top-skills",
        Role::Company,
        "Applicant Insights",
        "Top skills in applicant pool",
        "Most common skills among your applicants",
        "Analyze skills of all students who applied to my jobs. Show top 10 most common skills with frequency count.",
        ChartType::Bar,
        3,
    ),
    template(
        "company-conversion-funnel",
        Role::Company,
        "Hiring Analytics",
        "Hiring funnel analysis",
        "Application to selection conversion rates",
        "Create hiring funnel showing: total applications, candidates who passed to OA, candidates who passed to interview, and candidates selected. Show counts and conversion percentages at each stage.",
        ChartType::Funnel,
        4,
    ),
    template(
        "company-job-performance",
        Role::Company,
        "Hiring Analytics",
        "Job posting performance",
        "Compare performance across your job postings",
        "For each of my jobs, show: job title, total views (from analytics), total applications, conversion rate (applications/views), average applicant CGPA. Sort by applications descending.",
        ChartType::Table,
        5,
    ),
    template(
        "company-course-breakdown",
        Role::Company,
        "Applicant Insights",
        "Applicants by course",
        "Distribution of applicants across different courses",
        "Show distribution of applicants by their course (CSE, ECE, EEE, AIML, etc.). Include count and percentage for each course.",
        ChartType::Pie,
        6,
    ),
    template(
        "admin-platform-overview",
        Role::Admin,
        "Platform Stats",
        "Platform overview",
        "High-level statistics across the entire platform",
        "Provide comprehensive platform statistics: total users (by role), total students, total companies, total jobs (active/inactive), total applications, overall application success rate, average applications per job, and average jobs per company.",
        ChartType::Metric,
        1,
    ),
    template(
        "admin-registration-trends",
        Role::Admin,
        "Growth Analytics",
        "Registration trends",
        "Student vs company registration over time",
        "Show registration trends for students and companies over the last 3 months. Group by week and show separate counts for students and companies.",
        ChartType::Line,
        2,
    ),
    template(
        "admin-job-trends",
        Role::Admin,
        "Platform Stats",
        "Job posting activity",
        "Job posting trends over time",
        "Show job posting activity over the last 3 months. Group by week and show count of new jobs posted each week.",
        ChartType::Line,
        3,
    ),
    template(
        "admin-success-by-course",
        Role::Admin,
        "Placement Analytics",
        "Success rates by course",
        "Application selection rates for each course",
        "Calculate application success rate (selected/total applications) for each course (CSE, ECE, EEE, AIML). Show course, total applications, selections, and success rate percentage.",
        ChartType::Bar,
        4,
    ),
    template(
        "admin-active-companies",
        Role::Admin,
        "Platform Stats",
        "Most active companies",
        "Companies ranked by hiring activity",
        "Rank companies by total jobs posted and total applications received. Show top 10 companies with: company name, total jobs, total applications, average applications per job, and total selections made.",
        ChartType::Table,
        5,
    ),
    template(
        "admin-cgpa-vs-success",
        Role::Admin,
        "Placement Analytics",
        "CGPA vs selection rate",
        "Correlation between CGPA and getting selected",
        "Analyze selection rates by CGPA ranges. Group students into CGPA buckets: <6.0, 6.0-7.0, 7.0-8.0, 8.0-9.0, >9.0. For each bucket show: total applications, total selections, and success rate percentage.",
        ChartType::Bar,
        6,
    ),
    template(
        "admin-application-status-dist",
        Role::Admin,
        "Platform Stats",
        "Overall application status distribution",
        "Platform-wide application status breakdown",
        "Show distribution of all applications across statuses: pending, oa, interview, selected, rejected. Include counts and percentages.",
        ChartType::Pie,
        7,
    ),
    template(
        "admin-salary-insights",
        Role::Admin,
        "Salary Analytics",
        "Salary distribution analysis",
        "Salary offerings across all jobs",
        "Analyze salary offerings across all jobs. Show distribution by salary ranges (in INR): <3L, 3-5L, 5-7L, 7-10L, 10-15L, >15L. Include job count for each range and calculate average salary overall.",
        ChartType::Bar,
        8,
    ),
];

pub fn template_by_id(id: &str) -> Option<&'static QueryTemplate> {
    TEMPLATES.iter().find(|t| t.id == id)
}

/// Templates for a role in display order.
pub fn templates_for_role(role: Role) -> Vec<&'static QueryTemplate> {
    let mut templates: Vec<_> = TEMPLATES.iter().filter(|t| t.role == role).collect();
    templates.sort_by_key(|t| t.sort_order);
    templates
}

pub fn templates_in_category(role: Role, category: &str) -> Vec<&'static QueryTemplate> {
    templates_for_role(role)
        .into_iter()
        .filter(|t| t.category == category)
        .collect()
}

/// Distinct categories for a role, in the order their first template appears.
pub fn categories_for_role(role: Role) -> Vec<&'static str> {
    let mut categories: Vec<&'static str> = Vec::new();
    for t in templates_for_role(role) {
        if !categories.contains(&t.category) {
            categories.push(t.category);
        }
    }
    categories
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_template_counts_per_role() {
        assert_eq!(templates_for_role(Role::Student).len(), 6);
        assert_eq!(templates_for_role(Role::Company).len(), 6);
        assert_eq!(templates_for_role(Role::Admin).len(), 8);
    }

    #[test]
    fn test_template_ids_are_unique() {
        let ids: HashSet<_> = TEMPLATES.iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), TEMPLATES.len());
    }

    #[test]
    fn test_templates_sorted_by_sort_order() {
        let orders: Vec<u32> = templates_for_role(Role::Admin)
            .iter()
            .map(|t| t.sort_order)
            .collect();
        assert_eq!(orders, (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn test_template_by_id() {
        let t = template_by_id("company-conversion-funnel").unwrap();
        assert_eq!(t.role, Role::Company);
        assert_eq!(t.chart_type, ChartType::Funnel);
        assert!(template_by_id("missing-template").is_none());
    }

    #[test]
    fn test_categories_keep_first_appearance_order() {
        assert_eq!(
            categories_for_role(Role::Student),
            vec![
                "Profile Analysis",
                "Market Insights",
                "Application Stats",
                "Job Recommendations"
            ]
        );
    }

    #[test]
    fn test_templates_in_category() {
        let stats = templates_in_category(Role::Company, "Hiring Analytics");
        assert_eq!(stats.len(), 3);
        assert!(stats.iter().all(|t| t.category == "Hiring Analytics"));
    }

    #[test]
    fn test_template_serializes_camel_case() {
        let json = serde_json::to_value(template_by_id("admin-salary-insights").unwrap()).unwrap();
        assert_eq!(json["chartType"], "bar");
        assert_eq!(json["sortOrder"], 8);
        assert_eq!(json["role"], "admin");
    }
}
