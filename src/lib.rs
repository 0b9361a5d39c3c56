//! Block Seek: a Web3 intelligence agent.
//!
//! A ReAct loop over an LLM picks among wallet, token, NFT, DeFi and
//! knowledge-base tools, served over an axum HTTP API.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod llm;
pub mod logger;
pub mod subsystems;
pub mod visualization;
