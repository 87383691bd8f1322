//! A parallel pipeline framework for analysing gridded climate data.
//!
//! The core is a demand-driven dataflow runtime: stages report the
//! metadata they can produce, downstream requests are translated
//! upstream through the graph, and execution answers each request with a
//! dataset. Work is parallel along three axes: distributed ranks behind
//! the [`comm::Communicator`] trait, a per-stage task pool for I/O and
//! map-reduce fan-out, and loop-parallel numeric kernels inside stages.
//!
//! A minimal pipeline:
//!
//! ```no_run
//! use std::sync::Arc;
//! use stratus::comm::SelfCommunicator;
//! use stratus::executive::IndexExecutive;
//! use stratus::pipeline::{Pipeline, PortHandle};
//! use stratus::stages;
//!
//! # async fn run() -> stratus::error::Result<()> {
//! let mut pipeline = Pipeline::new();
//! let source = pipeline.add_stage(stages::create_stage("source")?);
//! let writer = pipeline.add_stage(stages::create_stage("writer")?);
//! pipeline.connect(PortHandle::new(source, 0), writer, 0)?;
//! pipeline.set_property(source, "input_regex", ".*\\.cfb".into())?;
//! pipeline.set_property(writer, "file_name", "out_%t%.cfb".into())?;
//!
//! let mut executive = IndexExecutive::new(Arc::new(SelfCommunicator));
//! executive.set_arrays(vec!["T".to_string()]);
//! pipeline.run(PortHandle::new(writer, 0), &mut executive).await?;
//! # Ok(())
//! # }
//! ```

pub mod algorithm;
pub mod app;
pub mod array;
pub mod cache;
pub mod calendar;
pub mod comm;
pub mod dataset;
pub mod error;
pub mod executive;
pub mod io;
pub mod logging;
pub mod metadata;
pub mod pipeline;
pub mod pool;
pub mod properties;
pub mod stages;
pub mod stream;

pub use algorithm::{Algorithm, Request};
pub use array::{ElementType, VariantArray};
pub use dataset::{ArrayCollection, CartesianMesh, Dataset, DatasetRef, Table};
pub use error::{Error, Result};
pub use metadata::Metadata;
pub use pipeline::{Pipeline, PortHandle};
