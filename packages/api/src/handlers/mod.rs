// ABOUTME: Handler modules for the /v1 HTTP surface

pub mod admin;
pub mod capabilities;
pub mod cargos;
pub mod history;
pub mod sandboxes;
pub mod skills;
