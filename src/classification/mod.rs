pub mod chain;
pub mod expression;
pub mod scheme;
