//! skillgate: trust lifecycle for third-party agent skills.
//!
//! A skill is untrusted until proven otherwise. It is statically audited,
//! then runs only inside a resource-capped Docker sandbox whose sole network
//! exit is a per-skill allowlisting proxy. After a sustained streak of clean
//! runs, and only with a human's explicit approval, it is promoted to host
//! execution. Any flagged run quarantines it until a manual review.
//!
//! Sensitive actions are held for human approval; an approval grants a
//! short session lease for similar actions.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod approval;
pub mod audit;
pub mod config;
pub mod executor;
pub mod ledger;
pub mod logging;
pub mod policy;
pub mod runtime;
pub mod skill;
