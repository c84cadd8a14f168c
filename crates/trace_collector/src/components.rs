//! The factory set the collector binary runs with.

use pipeline_core::{
    make_factory_map, ExporterFactory, Factories, FactoryError, ProcessorFactory, ReceiverFactory,
};
use std::sync::Arc;

use crate::broker::BrokerConnector;
use crate::exporter::{OlapExporterFactory, TraceRepository};
use crate::processor::QueueProcessorFactory;
use crate::receiver::BrokerReceiverFactory;

/// Broker receiver, queue processor and OLAP exporter factories.
///
/// The connector and repository are shared by every component built from
/// the returned set.
pub fn components(
    connector: Arc<dyn BrokerConnector>,
    repository: Arc<dyn TraceRepository>,
) -> Result<Factories, FactoryError> {
    let receivers: Vec<Arc<dyn ReceiverFactory>> = vec![Arc::new(BrokerReceiverFactory::new(connector))];
    let processors: Vec<Arc<dyn ProcessorFactory>> = vec![Arc::new(QueueProcessorFactory::new())];
    let exporters: Vec<Arc<dyn ExporterFactory>> = vec![Arc::new(OlapExporterFactory::new(repository))];

    Ok(Factories {
        receivers: make_factory_map(receivers)?,
        processors: make_factory_map(processors)?,
        exporters: make_factory_map(exporters)?,
    })
}
