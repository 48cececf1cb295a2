pub mod breaker;
pub mod gateway;
pub mod rules;
