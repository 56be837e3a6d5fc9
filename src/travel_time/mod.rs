pub mod record;
pub mod service;
