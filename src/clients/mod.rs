//! Centralized client adapters for the external IaaS and source-agent APIs
//! (spec §6, §9 "direct HTTP client creation" design note).
//!
//! Every consumer (C2, C3, C4, C5, C7) talks to these trait objects rather
//! than constructing `reqwest::Client`s at the call site, so tests
//! substitute deterministic fakes.

pub mod iaas;
pub mod source_agent;

pub use iaas::{AsyncJobResult, IaasClient, IaasVm, IaasVolume, ReqwestIaasClient};
pub use source_agent::{
    AgentProgress, HttpSourceAgentClient, SourceAgentClient, SourceAgentReply,
};
