//! Invoice Agent: classifies incoming documents and files them.

pub mod api;
pub mod config;
pub mod error;
pub mod extract;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod safety;
pub mod storage;
