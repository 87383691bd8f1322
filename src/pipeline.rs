//! The pipeline driver.
//!
//! Owns the directed acyclic graph of stages and drives the three passes:
//! bottom-up metadata reports (cached per output port), downstream-to-
//! upstream request translation, and upstream-to-downstream execution.
//! Stages reference each other only through `(node, port)` handles; the
//! driver holds the single owning reference to every stage, so the graph
//! cannot form reference cycles.
//!
//! Reported metadata is referentially transparent: a cached report is
//! reused until the stage's properties change (`set_property` /
//! `set_modified`), and invalidation propagates to every downstream
//! stage. A second `update_metadata` with no changes does not touch the
//! stages at all.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};

use crate::algorithm::{Algorithm, ReduceOrder, Request};
use crate::dataset::{Dataset, DatasetRef};
use crate::error::{Error, Result};
use crate::executive::IndexExecutive;
use crate::metadata::Metadata;
use crate::pool::resolve_width;

pub type NodeId = usize;

/// Address of one stage output (or input slot): stage id + port index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortHandle {
    pub node: NodeId,
    pub port: usize,
}

impl PortHandle {
    pub fn new(node: NodeId, port: usize) -> Self {
        Self { node, port }
    }
}

struct Node {
    name: String,
    algorithm: Box<dyn Algorithm>,
    /// Upstream connection per input port.
    inputs: Vec<Option<PortHandle>>,
    /// Cached reported metadata per output port; `None` when invalidated.
    report_cache: Vec<Option<Metadata>>,
}

#[derive(Default)]
pub struct Pipeline {
    nodes: Vec<Node>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stage under its type name.
    pub fn add_stage(&mut self, algorithm: Box<dyn Algorithm>) -> NodeId {
        let name = algorithm.name().to_string();
        self.add_named_stage(name, algorithm)
    }

    /// Adds a stage under an explicit instance name (used by `--set`
    /// routing when a pipeline holds two stages of the same type).
    pub fn add_named_stage(
        &mut self,
        name: impl Into<String>,
        algorithm: Box<dyn Algorithm>,
    ) -> NodeId {
        let node = Node {
            name: name.into(),
            inputs: vec![None; algorithm.input_ports()],
            report_cache: vec![None; algorithm.output_ports()],
            algorithm,
        };
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn stage_id(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name)
    }

    pub fn stage_name(&self, node: NodeId) -> &str {
        &self.nodes[node].name
    }

    pub fn algorithm(&self, node: NodeId) -> &dyn Algorithm {
        self.nodes[node].algorithm.as_ref()
    }

    /// Connects an upstream output to a downstream input port.
    pub fn connect(&mut self, upstream: PortHandle, node: NodeId, input_port: usize) -> Result<()> {
        if upstream.node >= self.nodes.len() || node >= self.nodes.len() {
            return Err(Error::config("connect: no such stage"));
        }
        if upstream.port >= self.nodes[upstream.node].algorithm.output_ports() {
            return Err(Error::config(format!(
                "stage '{}' has no output port {}",
                self.nodes[upstream.node].name, upstream.port
            )));
        }
        if input_port >= self.nodes[node].inputs.len() {
            return Err(Error::config(format!(
                "stage '{}' has no input port {input_port}",
                self.nodes[node].name
            )));
        }
        if upstream.node == node || self.depends_on(upstream.node, node) {
            return Err(Error::config(format!(
                "connecting '{}' to '{}' would create a cycle",
                self.nodes[upstream.node].name, self.nodes[node].name
            )));
        }
        self.nodes[node].inputs[input_port] = Some(upstream);
        self.set_modified(node);
        Ok(())
    }

    /// Whether `node` transitively consumes `candidate`'s output.
    fn depends_on(&self, node: NodeId, candidate: NodeId) -> bool {
        let mut queue = VecDeque::from([node]);
        while let Some(current) = queue.pop_front() {
            for input in self.nodes[current].inputs.iter().flatten() {
                if input.node == candidate {
                    return true;
                }
                queue.push_back(input.node);
            }
        }
        false
    }

    /// Routes a property value to a stage and invalidates its cached
    /// report and every downstream cache.
    pub fn set_property(
        &mut self,
        node: NodeId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.nodes[node].algorithm.set_property(key, value)?;
        self.set_modified(node);
        Ok(())
    }

    /// Explicit invalidation of a stage's cached report (and transitively
    /// of all consumers).
    pub fn set_modified(&mut self, node: NodeId) {
        let mut queue = VecDeque::from([node]);
        while let Some(current) = queue.pop_front() {
            self.nodes[current].report_cache.fill(None);
            for downstream in 0..self.nodes.len() {
                if downstream != current
                    && self.nodes[downstream]
                        .inputs
                        .iter()
                        .flatten()
                        .any(|h| h.node == current)
                {
                    queue.push_back(downstream);
                }
            }
        }
    }

    fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut in_degree: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| n.inputs.iter().flatten().count())
            .collect();
        let mut ready: VecDeque<NodeId> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop_front() {
            order.push(node);
            for (downstream, n) in self.nodes.iter().enumerate() {
                let edges = n.inputs.iter().flatten().filter(|h| h.node == node).count();
                if edges > 0 {
                    in_degree[downstream] -= edges;
                    if in_degree[downstream] == 0 {
                        ready.push_back(downstream);
                    }
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(Error::config("pipeline graph contains a cycle"));
        }
        Ok(order)
    }

    /// Input metadata of a node, cloned from the upstream caches.
    fn input_metadata(&self, node: NodeId) -> Result<Vec<Metadata>> {
        self.nodes[node]
            .inputs
            .iter()
            .enumerate()
            .map(|(port, input)| {
                let handle = input.ok_or_else(|| {
                    Error::config(format!(
                        "input port {port} of stage '{}' is not connected",
                        self.nodes[node].name
                    ))
                })?;
                self.nodes[handle.node].report_cache[handle.port]
                    .clone()
                    .ok_or_else(|| {
                        Error::config(format!(
                            "stage '{}' has no cached report for consumer '{}'",
                            self.nodes[handle.node].name, self.nodes[node].name
                        ))
                    })
            })
            .collect()
    }

    /// Bottom-up report pass. Fatal for the whole update when any stage
    /// fails to report.
    pub async fn update_metadata(&mut self) -> Result<()> {
        for node in self.topological_order()? {
            if self.nodes[node].report_cache.iter().all(Option::is_some) {
                continue;
            }
            let input_md = self.input_metadata(node)?;
            for port in 0..self.nodes[node].report_cache.len() {
                let report = self.nodes[node]
                    .algorithm
                    .report_metadata(port, &input_md)
                    .await
                    .map_err(|e| {
                        tracing::error!(stage = %self.nodes[node].name, "report_metadata failed: {e}");
                        e
                    })?;
                tracing::debug!(stage = %self.nodes[node].name, port, "reported metadata");
                self.nodes[node].report_cache[port] = Some(report);
            }
        }
        Ok(())
    }

    /// Cached reported metadata of a stage output. `update_metadata` must
    /// have run since the last invalidation.
    pub fn output_metadata(&self, handle: PortHandle) -> Result<&Metadata> {
        self.nodes[handle.node].report_cache[handle.port]
            .as_ref()
            .ok_or_else(|| {
                Error::config(format!(
                    "no cached report for stage '{}'; call update_metadata first",
                    self.nodes[handle.node].name
                ))
            })
    }

    /// Demand-driven execution of one request against a stage output.
    ///
    /// Translates the request, pulls every upstream answer (fanning a
    /// request sequence out with the stage's configured concurrency and
    /// folding it through the stage's reduce operator), then executes.
    pub fn pull<'a>(
        &'a self,
        handle: PortHandle,
        request: &Request,
    ) -> BoxFuture<'a, Result<DatasetRef>> {
        let request = request.clone();
        async move {
            let node = &self.nodes[handle.node];
            let input_md = self.input_metadata(handle.node)?;
            let translated = node
                .algorithm
                .translate_request(handle.port, &input_md, &request)
                .map_err(|e| {
                    tracing::error!(stage = %node.name, "translate_request failed: {e}");
                    e
                })?;
            if translated.len() != node.inputs.len() {
                return Err(Error::config(format!(
                    "stage '{}' translated {} request sequences for {} input ports",
                    node.name,
                    translated.len(),
                    node.inputs.len()
                )));
            }

            let mut inputs: Vec<DatasetRef> = Vec::with_capacity(translated.len());
            for (port, requests) in translated.into_iter().enumerate() {
                // Connectivity was checked by input_metadata above.
                let upstream = node.inputs[port].expect("connected input");
                inputs.push(self.pull_sequence(node, upstream, requests).await?);
            }

            node.algorithm
                .execute(handle.port, inputs, &request)
                .await
                .map_err(|e| {
                    tracing::error!(stage = %node.name, "execute failed: {e}");
                    e
                })
        }
        .boxed()
    }

    /// Answers one input port's request sequence: empty → empty dataset,
    /// singleton → plain pull, longer → bounded fan-out plus reduce.
    async fn pull_sequence(
        &self,
        node: &Node,
        upstream: PortHandle,
        requests: Vec<Request>,
    ) -> Result<DatasetRef> {
        if requests.is_empty() {
            return Ok(Arc::new(Dataset::Empty));
        }
        if requests.len() == 1 {
            return self.pull(upstream, &requests[0]).await;
        }

        let order = node.algorithm.reduction().ok_or_else(|| {
            Error::config(format!(
                "stage '{}' translated a request sequence but defines no reduction",
                node.name
            ))
        })?;
        let width = resolve_width(node.algorithm.concurrency());
        let missing_ok = node.algorithm.missing_ok();
        let total = requests.len();

        let pulls: Vec<_> = requests.iter().map(|r| self.pull(upstream, r)).collect();
        let mut results = match order {
            ReduceOrder::Ordered => stream::iter(pulls).buffered(width).boxed(),
            ReduceOrder::Unordered => stream::iter(pulls).buffer_unordered(width).boxed(),
        };

        let mut accumulated: Option<DatasetRef> = None;
        let mut dropped = 0usize;
        while let Some(result) = results.next().await {
            match result {
                Ok(dataset) => {
                    accumulated = Some(match accumulated.take() {
                        None => dataset,
                        Some(partial) => node.algorithm.reduce(partial, dataset)?,
                    });
                }
                Err(e) if missing_ok => {
                    dropped += 1;
                    tracing::warn!(stage = %node.name, "dropping failed upstream datum: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        if dropped > 0 {
            tracing::warn!(stage = %node.name, dropped, total, "reduction ran with missing data");
        }
        match accumulated {
            Some(dataset) => Ok(dataset),
            // Every datum failed; missing_ok was set or we'd have bailed.
            None => Ok(Arc::new(Dataset::Empty)),
        }
    }

    /// Runs the pipeline: one pull of the terminal output per executive
    /// request. A failed request is logged and skipped; the run continues
    /// with the next index.
    pub async fn run(
        &mut self,
        terminal: PortHandle,
        executive: &mut IndexExecutive,
    ) -> Result<Vec<DatasetRef>> {
        self.update_metadata().await?;
        let metadata = self.output_metadata(terminal)?.clone();
        executive.initialize(&metadata)?;

        let mut outputs = Vec::new();
        while let Some(request) = executive.next_request() {
            match self.pull(terminal, &request).await {
                Ok(dataset) => outputs.push(dataset),
                Err(e) => {
                    tracing::error!(stage = %self.nodes[terminal.node].name, "request failed: {e}");
                }
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{forward_index_keys, keys};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Zero-input stage that counts how often it reports.
    struct CountingSource {
        reports: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Algorithm for CountingSource {
        fn name(&self) -> &'static str {
            "counting_source"
        }

        fn input_ports(&self) -> usize {
            0
        }

        fn set_property(&mut self, key: &str, _value: serde_json::Value) -> Result<()> {
            if key == "marker" {
                Ok(())
            } else {
                Err(Error::config(format!("no property '{key}'")))
            }
        }

        async fn report_metadata(&self, _port: usize, _input_md: &[Metadata]) -> Result<Metadata> {
            self.reports.fetch_add(1, Ordering::Relaxed);
            let mut md = Metadata::new();
            md.set_string(keys::INDEX_INITIALIZER_KEY, keys::NUMBER_OF_TIME_STEPS);
            md.set_string(keys::INDEX_REQUEST_KEY, "time_step");
            md.set_u64(keys::NUMBER_OF_TIME_STEPS, 3);
            Ok(md)
        }

        fn translate_request(
            &self,
            _port: usize,
            _input_md: &[Metadata],
            _request: &Request,
        ) -> Result<Vec<Vec<Request>>> {
            Ok(Vec::new())
        }

        async fn execute(
            &self,
            _port: usize,
            _inputs: Vec<DatasetRef>,
            _request: &Request,
        ) -> Result<DatasetRef> {
            Ok(Arc::new(Dataset::Empty))
        }
    }

    struct PassThrough {
        reports: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Algorithm for PassThrough {
        fn name(&self) -> &'static str {
            "pass_through"
        }

        async fn report_metadata(&self, _port: usize, input_md: &[Metadata]) -> Result<Metadata> {
            self.reports.fetch_add(1, Ordering::Relaxed);
            let mut report = input_md[0].clone();
            forward_index_keys(&mut report, &input_md[0])?;
            Ok(report)
        }

        fn translate_request(
            &self,
            _port: usize,
            _input_md: &[Metadata],
            request: &Request,
        ) -> Result<Vec<Vec<Request>>> {
            Ok(vec![vec![request.clone()]])
        }

        async fn execute(
            &self,
            _port: usize,
            inputs: Vec<DatasetRef>,
            _request: &Request,
        ) -> Result<DatasetRef> {
            Ok(inputs.into_iter().next().unwrap_or_else(|| Arc::new(Dataset::Empty)))
        }
    }

    fn counted_pipeline() -> (Pipeline, NodeId, NodeId, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let source_reports = Arc::new(AtomicUsize::new(0));
        let pass_reports = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        let source = pipeline.add_stage(Box::new(CountingSource {
            reports: source_reports.clone(),
        }));
        let pass = pipeline.add_stage(Box::new(PassThrough {
            reports: pass_reports.clone(),
        }));
        pipeline
            .connect(PortHandle::new(source, 0), pass, 0)
            .unwrap();
        (pipeline, source, pass, source_reports, pass_reports)
    }

    #[tokio::test]
    async fn repeated_updates_reuse_cached_reports() {
        let (mut pipeline, _source, pass, source_reports, _pass_reports) = counted_pipeline();
        pipeline.update_metadata().await.unwrap();
        pipeline.update_metadata().await.unwrap();
        assert_eq!(source_reports.load(Ordering::Relaxed), 1);
        assert_eq!(
            pipeline
                .output_metadata(PortHandle::new(pass, 0))
                .unwrap()
                .get_u64(keys::NUMBER_OF_TIME_STEPS),
            Some(3)
        );
    }

    #[tokio::test]
    async fn property_changes_invalidate_downstream_caches() {
        let (mut pipeline, source, _pass, source_reports, pass_reports) = counted_pipeline();
        pipeline.update_metadata().await.unwrap();
        pipeline
            .set_property(source, "marker", serde_json::json!(1))
            .unwrap();
        pipeline.update_metadata().await.unwrap();
        assert_eq!(source_reports.load(Ordering::Relaxed), 2);
        assert_eq!(pass_reports.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn explicit_set_modified_forces_one_re_report() {
        let (mut pipeline, _source, pass, _source_reports, pass_reports) = counted_pipeline();
        pipeline.update_metadata().await.unwrap();
        pipeline.set_modified(pass);
        pipeline.update_metadata().await.unwrap();
        assert_eq!(pass_reports.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn pull_walks_the_graph() {
        let (mut pipeline, _source, pass, _a, _b) = counted_pipeline();
        pipeline.update_metadata().await.unwrap();
        let mut request = Request::new();
        request.set_u64("time_step", 0);
        let dataset = pipeline
            .pull(PortHandle::new(pass, 0), &request)
            .await
            .unwrap();
        assert!(dataset.is_empty());
    }

    #[test]
    fn cycles_are_rejected_at_connect() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.add_named_stage(
            "a",
            Box::new(PassThrough {
                reports: Arc::new(AtomicUsize::new(0)),
            }),
        );
        let b = pipeline.add_named_stage(
            "b",
            Box::new(PassThrough {
                reports: Arc::new(AtomicUsize::new(0)),
            }),
        );
        pipeline.connect(PortHandle::new(a, 0), b, 0).unwrap();
        assert!(pipeline.connect(PortHandle::new(b, 0), a, 0).is_err());
        assert!(pipeline.connect(PortHandle::new(a, 0), a, 0).is_err());
    }

    #[test]
    fn bad_ports_are_rejected_at_connect() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.add_stage(Box::new(CountingSource {
            reports: Arc::new(AtomicUsize::new(0)),
        }));
        let b = pipeline.add_stage(Box::new(PassThrough {
            reports: Arc::new(AtomicUsize::new(0)),
        }));
        assert!(pipeline.connect(PortHandle::new(a, 1), b, 0).is_err());
        assert!(pipeline.connect(PortHandle::new(a, 0), b, 7).is_err());
    }
}
