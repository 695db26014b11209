//! Document workflow core.
//!
//! Every stored attachment flows through:
//! 1. `TextExtractor::extract()`: bounded plain text
//! 2. `Classifier::classify()`: invoice / non_invoice via the model provider
//! 3. `FilingPolicy::decide()`: label → folder, collision-free name
//! 4. Cleanup: the temp copy is released exactly once
//!
//! `WorkflowEngine` runs one item; `RunAggregator` runs batches and reports.

pub mod aggregator;
pub mod classifier;
pub mod email_processor;
pub mod filing;
pub mod retry;
pub mod state;
pub mod types;
pub mod workflow;
