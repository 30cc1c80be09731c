pub mod auth_method;
pub mod challenge;
