pub mod context;
pub mod policy;
