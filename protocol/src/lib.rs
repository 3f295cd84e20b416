// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # p2pmesh — Core Library
//!
//! A flood-broadcast mesh: nodes hold direct links to some neighbours,
//! established through an external signaling relay, and every message a
//! node publishes reaches every node it is transitively linked to, exactly
//! once, with no central broker on the data path.
//!
//! ## Architecture
//!
//! - **mesh** — Envelopes, dedup cache, connection lifecycle, flooding,
//!   local dispatch, and the node that ties them together.
//! - **config** — Protocol constants and defaults.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use p2pmesh_protocol::mesh::{LoopbackFabric, LoopbackHub, MeshNode};
//! use serde_json::json;
//!
//! # async fn demo() -> p2pmesh_protocol::mesh::MeshResult<()> {
//! let fabric = Arc::new(LoopbackFabric::new());
//! let hub = LoopbackHub::new();
//!
//! let a = Arc::new(MeshNode::new("a", fabric.clone()));
//! let b = Arc::new(MeshNode::new("b", fabric.clone()));
//! a.connect(&hub.client("a"), "loopback://hub").await?;
//! b.connect(&hub.client("b"), "loopback://hub").await?;
//!
//! b.subscribe("chat", |payload| println!("b got {payload}"));
//! hub.link("a", "b").await?;
//! a.publish("chat", json!("hello"))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod mesh;
