#![warn(clippy::perf)]
#![allow(clippy::type_complexity)]
#![doc = include_str!("../README.md")]

//! ## Reading a dump
//!
//! Two entry points cover the two workloads:
//!
//! - [`read_file`] / [`read_bytes`] fully materialize a dump into a
//!   [`GraphDocument`].  Right for small dumps and tests.
//! - [`scan_file`] / [`scan_bytes`] stream over the dump once, recording
//!   only the byte range and pool snapshots of every top-level record plus
//!   lightweight per-graph metadata.  The result is a [`ScannedDocument`]
//!   of [`LazyGroup`]/[`LazyGraph`] placeholders that decode their
//!   contents in the background on first demand and release them when the
//!   last consumer lets go.  Right for gigabyte-class traces.
//!
//! ```no_run
//! use graphdump::scan_file;
//!
//! fn main() -> anyhow::Result<()> {
//!     env_logger::init();
//!     let doc = scan_file("trace.bgv")?;
//!     for entry in doc.index.summary() {
//!         println!("{entry:?}");
//!     }
//!     if let Some(group) = doc.lazy_groups().next() {
//!         let loaded = group.complete_contents().get();
//!         println!("{} children", loaded.loaded().map_or(0, |g| g.elements.len()));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Custom builders
//!
//! The [`BinaryReader`] is agnostic about what happens with the records it
//! decodes: it emits semantic events to a [`Builder`].  Implement the trait
//! to derive anything else from a dump in a single pass; the bundled
//! builders ([`ModelBuilder`], [`ScanningModelBuilder`],
//! [`SingleGroupBuilder`]) are ordinary implementations with no private
//! privileges.

#[macro_use]
extern crate log;

mod builder;
mod cache;
mod errors;
mod lazy;
mod model;
mod model_builder;
mod pool;
mod reader;
mod scan;
mod single;
mod source;

#[cfg(test)]
mod testutil;

pub use builder::*;
pub use cache::*;
pub use errors::*;
pub use lazy::*;
pub use model::*;
pub use model_builder::*;
pub use pool::*;
pub use reader::BinaryReader;
pub use scan::*;
pub use single::*;
pub use source::*;
