pub mod config;
pub mod engine;
pub mod evaluator;
pub mod grading;

#[cfg(test)]
mod engine_tests;
#[cfg(test)]
mod testing;
