//! Which streams and stores each view needs.

use crate::collaborators::FetchRequest;
use crate::config::EngineConfig;
use crate::subscriptions::{RowPredicate, SubscriptionConfig, SubscriptionFilter};
use crate::types::Source;

use super::{ViewContext, ViewKey};

/// One live stream of a view plus the bulk load that seeds its store.
#[derive(Clone, Debug)]
pub struct StreamPlan {
    pub subscription: SubscriptionConfig,
    pub fetch: FetchRequest,
}

impl StreamPlan {
    pub fn source(&self) -> Source {
        self.subscription.source
    }

    fn new(
        source: Source,
        filter: SubscriptionFilter,
        predicate: RowPredicate,
        config: &EngineConfig,
    ) -> Self {
        Self {
            subscription: SubscriptionConfig::new(source)
                .with_filter(filter.with_predicate(predicate.clone()))
                .with_buffer_size(config.subscription_buffer),
            fetch: FetchRequest::new(source, predicate),
        }
    }

    fn log_tail(source: Source, config: &EngineConfig) -> Self {
        let mut plan = Self::new(
            source,
            SubscriptionFilter::inserts(),
            RowPredicate::All,
            config,
        );
        plan.fetch = plan.fetch.with_limit(config.log_capacity);
        plan
    }
}

/// Streams for a view, built from the activation context.
pub fn plan_for(key: &ViewKey, context: &ViewContext, config: &EngineConfig) -> Vec<StreamPlan> {
    match key {
        ViewKey::InvoiceList => vec![StreamPlan::new(
            Source::Invoices,
            SubscriptionFilter::all(),
            RowPredicate::eq("user_id", context.user.as_str()),
            config,
        )],
        ViewKey::InvoiceDetail(id) => vec![StreamPlan::new(
            Source::Invoices,
            SubscriptionFilter::all(),
            RowPredicate::eq("id", id.as_str()),
            config,
        )],
        ViewKey::SystemStatus => vec![
            StreamPlan::log_tail(Source::SystemLogs, config),
            StreamPlan::log_tail(Source::IntegrationLogs, config),
        ],
        ViewKey::FieldSettings => vec![StreamPlan::new(
            Source::FieldConfigurations,
            SubscriptionFilter::all(),
            RowPredicate::All,
            config,
        )],
    }
}
