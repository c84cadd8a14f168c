//! Per-tenant pipeline graph.
//!
//! Nodes are receivers, processors, a single fan-out and exporters, connected
//! in a line: every receiver feeds the first processor, processors chain in
//! list order, the last processor feeds the fan-out, and the fan-out feeds
//! every exporter. Components are instantiated in reverse topological order so
//! each node's downstream consumer exists before the node itself is built.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::component::{Component, ComponentError, ComponentKind, CreateSettings, Exporter, Processor, Receiver};
use crate::component_id::ComponentId;
use crate::config::TenantConfig;
use crate::consumer::Consumer;
use crate::error::MultiError;
use crate::factory::{BuildError, ExporterBuilder, ProcessorBuilder, ReceiverBuilder};
use crate::fanout::FanOut;

const FAN_OUT_SEED: &str = "fanout_to_exporters";

/// Stable node identity derived from the node kind and component id.
pub type NodeId = u64;

fn node_id(kind: &str, key: &str) -> NodeId {
    let mut bytes = Vec::with_capacity(kind.len() + key.len() + 1);
    bytes.extend_from_slice(kind.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(key.as_bytes());
    xxh3_64(&bytes)
}

/// Graph construction and lifecycle errors
#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("pipeline must contain at least one {0}")]
    Empty(ComponentKind),
    #[error("cycle detected at {0}")]
    Cycle(String),
    #[error("{node} expects exactly one downstream consumer, found {found}")]
    Consumers { node: String, found: usize },
    #[error("failed to start {node}: {source}")]
    Start {
        node: String,
        #[source]
        source: ComponentError,
    },
}

enum NodeComponent {
    Receiver(Option<Arc<dyn Receiver>>),
    Processor(Option<Arc<dyn Processor>>),
    FanOut(Option<Arc<FanOut>>),
    Exporter(Option<Arc<dyn Exporter>>),
}

struct Node {
    id: NodeId,
    /// Component id, absent for the fan-out
    component_id: Option<ComponentId>,
    component: NodeComponent,
}

impl Node {
    fn receiver(id: &ComponentId) -> Self {
        Self::component(ComponentKind::Receiver, id, NodeComponent::Receiver(None))
    }

    fn processor(id: &ComponentId) -> Self {
        Self::component(ComponentKind::Processor, id, NodeComponent::Processor(None))
    }

    fn exporter(id: &ComponentId) -> Self {
        Self::component(ComponentKind::Exporter, id, NodeComponent::Exporter(None))
    }

    fn component(kind: ComponentKind, id: &ComponentId, component: NodeComponent) -> Self {
        Self {
            id: node_id(kind.as_str(), &id.to_string()),
            component_id: Some(id.clone()),
            component,
        }
    }

    fn fan_out() -> Self {
        Self {
            id: node_id("fanout", FAN_OUT_SEED),
            component_id: None,
            component: NodeComponent::FanOut(None),
        }
    }

    fn label(&self) -> String {
        let kind = match self.component {
            NodeComponent::Receiver(_) => "receiver",
            NodeComponent::Processor(_) => "processor",
            NodeComponent::FanOut(_) => "fanout",
            NodeComponent::Exporter(_) => "exporter",
        };
        match &self.component_id {
            Some(id) => format!("{kind} {id}"),
            None => kind.to_string(),
        }
    }

    /// The node as a consumer, once built. Receivers never consume.
    fn consumer(&self) -> Option<Arc<dyn Consumer>> {
        match &self.component {
            NodeComponent::Receiver(_) => None,
            NodeComponent::Processor(p) => p.clone().map(|p| p as Arc<dyn Consumer>),
            NodeComponent::FanOut(f) => f.clone().map(|f| f as Arc<dyn Consumer>),
            NodeComponent::Exporter(e) => e.clone().map(|e| e as Arc<dyn Consumer>),
        }
    }

    /// The node's lifecycle handle. The fan-out has none.
    fn lifecycle(&self) -> Option<Arc<dyn Component>> {
        match &self.component {
            NodeComponent::Receiver(r) => r.clone().map(|r| r as Arc<dyn Component>),
            NodeComponent::Processor(p) => p.clone().map(|p| p as Arc<dyn Component>),
            NodeComponent::FanOut(_) => None,
            NodeComponent::Exporter(e) => e.clone().map(|e| e as Arc<dyn Component>),
        }
    }
}

/// Everything needed to build one tenant's graph.
#[derive(Clone)]
pub struct GraphSettings {
    pub tenant: String,
    pub pipeline: TenantConfig,
    pub receivers: ReceiverBuilder,
    pub processors: ProcessorBuilder,
    pub exporters: ExporterBuilder,
}

/// A built pipeline graph for one tenant.
pub struct Graph {
    tenant: String,
    graph: DiGraph<Node, ()>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("tenant", &self.tenant)
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}

impl Graph {
    /// Builds the graph and instantiates every component.
    pub fn build(settings: GraphSettings) -> Result<Self, GraphError> {
        let pipeline = &settings.pipeline;
        for kind in [
            ComponentKind::Receiver,
            ComponentKind::Processor,
            ComponentKind::Exporter,
        ] {
            if pipeline.ids(kind).is_empty() {
                return Err(GraphError::Empty(kind));
            }
        }

        let mut graph = DiGraph::new();
        let mut index: HashMap<NodeId, NodeIndex> = HashMap::new();
        let mut add = |node: Node| -> NodeIndex {
            *index
                .entry(node.id)
                .or_insert_with(|| graph.add_node(node))
        };

        let receivers: Vec<_> = pipeline.receivers.iter().map(|id| add(Node::receiver(id))).collect();
        let processors: Vec<_> = pipeline.processors.iter().map(|id| add(Node::processor(id))).collect();
        let fan_out = add(Node::fan_out());
        let exporters: Vec<_> = pipeline.exporters.iter().map(|id| add(Node::exporter(id))).collect();

        // ids are non-empty per the check above
        let first_processor = processors[0];
        let last_processor = processors[processors.len() - 1];
        for &receiver in &receivers {
            graph.update_edge(receiver, first_processor, ());
        }
        for pair in processors.windows(2) {
            graph.update_edge(pair[0], pair[1], ());
        }
        graph.update_edge(last_processor, fan_out, ());
        for &exporter in &exporters {
            graph.update_edge(fan_out, exporter, ());
        }

        let mut built = Self {
            tenant: settings.tenant.clone(),
            graph,
        };
        let order = built.topological_order()?;
        for &node in order.iter().rev() {
            built.build_node(node, &settings)?;
        }

        debug!(
            tenant = %built.tenant,
            nodes = built.graph.node_count(),
            edges = built.graph.edge_count(),
            "pipeline graph built"
        );
        Ok(built)
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    fn topological_order(&self) -> Result<Vec<NodeIndex>, GraphError> {
        toposort(&self.graph, None).map_err(|cycle| GraphError::Cycle(self.graph[cycle.node_id()].label()))
    }

    fn build_node(&mut self, node: NodeIndex, settings: &GraphSettings) -> Result<(), GraphError> {
        // Downstream nodes come first in reverse topological order
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        next.sort();
        let consumers: Vec<(Option<ComponentId>, Arc<dyn Consumer>)> = next
            .iter()
            .filter_map(|&n| {
                let downstream = &self.graph[n];
                downstream
                    .consumer()
                    .map(|c| (downstream.component_id.clone(), c))
            })
            .collect();

        let label = self.graph[node].label();
        let tenant = self.tenant.clone();
        let single_consumer = |consumers: Vec<(Option<ComponentId>, Arc<dyn Consumer>)>| {
            let found = consumers.len();
            let mut iter = consumers.into_iter();
            match (iter.next(), found) {
                (Some((_, consumer)), 1) => Ok(consumer),
                _ => Err(GraphError::Consumers {
                    node: label.clone(),
                    found,
                }),
            }
        };

        let weight = &mut self.graph[node];
        let component_id = weight.component_id.clone();
        match &mut weight.component {
            NodeComponent::Exporter(slot) => {
                if let Some(id) = component_id {
                    let settings_for = CreateSettings::new(id, tenant);
                    *slot = Some(settings.exporters.create(&settings_for)?);
                }
            }
            NodeComponent::FanOut(slot) => {
                let downstreams = consumers
                    .into_iter()
                    .filter_map(|(id, consumer)| id.map(|id| (id, consumer)))
                    .collect();
                *slot = Some(Arc::new(FanOut::new(downstreams)));
            }
            NodeComponent::Processor(slot) => {
                if let Some(id) = component_id {
                    let consumer = single_consumer(consumers)?;
                    let settings_for = CreateSettings::new(id, tenant);
                    *slot = Some(settings.processors.create(&settings_for, consumer)?);
                }
            }
            NodeComponent::Receiver(slot) => {
                if let Some(id) = component_id {
                    let consumer = single_consumer(consumers)?;
                    let settings_for = CreateSettings::new(id, tenant);
                    *slot = Some(settings.receivers.create(&settings_for, consumer)?);
                }
            }
        }
        Ok(())
    }

    /// Starts components in reverse topological order (exporters first),
    /// stopping at the first failure.
    pub async fn start_all(&self) -> Result<(), GraphError> {
        let order = self.topological_order()?;
        for node in order.into_iter().rev() {
            let weight = &self.graph[node];
            let Some(component) = weight.lifecycle() else {
                continue;
            };
            let label = weight.label();
            info!(tenant = %self.tenant, component = %label, "starting component");
            component
                .start()
                .await
                .map_err(|source| GraphError::Start { node: label, source })?;
        }
        Ok(())
    }

    /// Shuts components down in topological order (receivers first),
    /// attempting every component and joining the failures.
    pub async fn shutdown_all(&self) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        let order = match self.topological_order() {
            Ok(order) => order,
            Err(err) => {
                errors.push(err);
                return errors.into_result();
            }
        };

        for node in order {
            let weight = &self.graph[node];
            let Some(component) = weight.lifecycle() else {
                continue;
            };
            let label = weight.label();
            info!(tenant = %self.tenant, component = %label, "shutting down component");
            if let Err(err) = component.shutdown().await {
                errors.push(format!("failed to shut down {label}: {err}"));
            }
        }
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CollectorConfig, ConfigProvider, YamlConfigProvider};
    use crate::testing::{test_factories_with, EventLog, TestFactory};

    const CONFIG: &str = r#"
receivers:
  nop/r1:
  nop/r2:
processors:
  nop/p1:
  nop/p2:
  nop/broken:
    failOnStart: true
    failOnShutdown: true
exporters:
  nop/e1:
  nop/e2:
"#;

    async fn settings(pipeline: TenantConfig, events: &EventLog) -> (GraphSettings, Arc<TestFactory>) {
        let factory = Arc::new(TestFactory::new("nop", events.clone()));
        let factories = test_factories_with(&factory);
        let config: CollectorConfig = YamlConfigProvider::from_yaml(CONFIG)
            .get(&factories)
            .await
            .unwrap();
        let settings = GraphSettings {
            tenant: "acme".to_string(),
            pipeline,
            receivers: ReceiverBuilder::new(config.receivers, factories.receivers),
            processors: ProcessorBuilder::new(config.processors, factories.processors),
            exporters: ExporterBuilder::new(config.exporters, factories.exporters),
        };
        (settings, factory)
    }

    fn pipeline(receivers: &[&str], processors: &[&str], exporters: &[&str]) -> TenantConfig {
        let ids = |list: &[&str]| -> Vec<ComponentId> { list.iter().map(|s| s.parse().unwrap()).collect() };
        TenantConfig {
            receivers: ids(receivers),
            processors: ids(processors),
            exporters: ids(exporters),
        }
    }

    #[tokio::test]
    async fn test_build_creates_downstream_first() {
        let events = EventLog::default();
        let (settings, factory) =
            settings(pipeline(&["nop/r1"], &["nop/p1", "nop/p2"], &["nop/e1"]), &events).await;

        let graph = Graph::build(settings).unwrap();

        // 1 receiver + 2 processors + fan-out + 1 exporter
        assert_eq!(graph.node_count(), 5);
        assert_eq!(factory.created(), 4);
        assert_eq!(
            events.filtered("create:"),
            vec![
                "create:exporter:nop/e1",
                "create:processor:nop/p2",
                "create:processor:nop/p1",
                "create:receiver:nop/r1",
            ]
        );
    }

    #[tokio::test]
    async fn test_start_and_shutdown_order() {
        let events = EventLog::default();
        let (settings, _) = settings(
            pipeline(&["nop/r1", "nop/r2"], &["nop/p1", "nop/p2"], &["nop/e1", "nop/e2"]),
            &events,
        )
        .await;
        let graph = Graph::build(settings).unwrap();

        graph.start_all().await.unwrap();
        let starts = events.filtered("start:");
        let position = |event: &str| starts.iter().position(|e| e == event).unwrap();
        assert_eq!(starts.len(), 6);
        assert!(position("start:exporter:nop/e1") < position("start:processor:nop/p2"));
        assert!(position("start:exporter:nop/e2") < position("start:processor:nop/p2"));
        assert!(position("start:processor:nop/p2") < position("start:processor:nop/p1"));
        assert!(position("start:processor:nop/p1") < position("start:receiver:nop/r1"));
        assert!(position("start:processor:nop/p1") < position("start:receiver:nop/r2"));

        graph.shutdown_all().await.unwrap();
        let stops = events.filtered("shutdown:");
        let position = |event: &str| stops.iter().position(|e| e == event).unwrap();
        assert_eq!(stops.len(), 6);
        assert!(position("shutdown:receiver:nop/r1") < position("shutdown:processor:nop/p1"));
        assert!(position("shutdown:receiver:nop/r2") < position("shutdown:processor:nop/p1"));
        assert!(position("shutdown:processor:nop/p1") < position("shutdown:processor:nop/p2"));
        assert!(position("shutdown:processor:nop/p2") < position("shutdown:exporter:nop/e1"));
    }

    #[tokio::test]
    async fn test_start_stops_at_first_failure() {
        let events = EventLog::default();
        let (settings, _) =
            settings(pipeline(&["nop/r1"], &["nop/broken"], &["nop/e1"]), &events).await;
        let graph = Graph::build(settings).unwrap();

        let err = graph.start_all().await.unwrap_err();
        assert!(err.to_string().contains("processor nop/broken"));
        // the receiver is upstream of the failure and never started
        assert_eq!(
            events.filtered("start:"),
            vec!["start:exporter:nop/e1", "start:processor:nop/broken"]
        );
    }

    #[tokio::test]
    async fn test_shutdown_attempts_every_component() {
        let events = EventLog::default();
        let (settings, _) =
            settings(pipeline(&["nop/r1"], &["nop/broken"], &["nop/e1"]), &events).await;
        let graph = Graph::build(settings).unwrap();

        let err = graph.shutdown_all().await.unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err.contains("nop/broken"));
        assert_eq!(events.filtered("shutdown:").len(), 3);
    }

    #[tokio::test]
    async fn test_repeated_processor_is_a_cycle() {
        let events = EventLog::default();
        let (settings, factory) = settings(
            pipeline(&["nop/r1"], &["nop/p1", "nop/p2", "nop/p1"], &["nop/e1"]),
            &events,
        )
        .await;

        let err = Graph::build(settings).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_processor_repeated_back_to_back_is_a_cycle() {
        let events = EventLog::default();
        let (settings, _) =
            settings(pipeline(&["nop/r1"], &["nop/p1", "nop/p1"], &["nop/e1"]), &events).await;
        assert!(matches!(Graph::build(settings), Err(GraphError::Cycle(_))));
    }

    #[tokio::test]
    async fn test_unconfigured_component_fails_build() {
        let events = EventLog::default();
        let (settings, _) =
            settings(pipeline(&["nop/r1"], &["nop/p1"], &["nop/missing"]), &events).await;

        let err = Graph::build(settings).unwrap_err();
        assert_eq!(err.to_string(), "exporter nop/missing is not configured");
    }

    #[tokio::test]
    async fn test_duplicate_receivers_and_exporters_collapse() {
        let events = EventLog::default();
        let (settings, factory) = settings(
            pipeline(&["nop/r1", "nop/r1"], &["nop/p1"], &["nop/e1", "nop/e1"]),
            &events,
        )
        .await;

        let graph = Graph::build(settings).unwrap();
        assert_eq!(graph.node_count(), 4);
        assert_eq!(factory.created(), 3);
    }
}
