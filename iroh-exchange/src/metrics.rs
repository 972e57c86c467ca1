use iroh_metrics::{Counter, MetricsGroup};

/// Metrics for a single exchange engine.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "bitswap")]
pub struct Metrics {
    /*
     * Inbound
     */
    #[metrics(help = "Number of blocks received.")]
    pub blocks_received: Counter,
    #[metrics(help = "Number of block bytes received.")]
    pub data_received: Counter,
    #[metrics(help = "Number of blocks received that were already in the store.")]
    pub dup_blocks_received: Counter,
    #[metrics(help = "Number of duplicate block bytes received.")]
    pub dup_data_received: Counter,
    #[metrics(help = "Number of messages received.")]
    pub messages_received: Counter,
    #[metrics(help = "Number of inbound messages discarded as malformed.")]
    pub messages_malformed: Counter,

    /*
     * Outbound
     */
    #[metrics(help = "Number of blocks sent.")]
    pub blocks_sent: Counter,
    #[metrics(help = "Number of block bytes sent.")]
    pub data_sent: Counter,
    #[metrics(help = "Number of messages sent.")]
    pub messages_sent: Counter,
    #[metrics(help = "Number of messages dropped after exhausting send retries.")]
    pub messages_dropped: Counter,
    #[metrics(help = "Number of failed send attempts.")]
    pub send_errors: Counter,
    #[metrics(help = "Number of message queues started.")]
    pub message_queues_created: Counter,
    #[metrics(help = "Number of message queues stopped.")]
    pub message_queues_stopped: Counter,

    /*
     * Sessions and discovery
     */
    #[metrics(help = "Number of sessions created.")]
    pub sessions_created: Counter,
    #[metrics(help = "Number of sessions closed.")]
    pub sessions_closed: Counter,
    #[metrics(help = "Number of provider queries issued to content routing.")]
    pub provider_queries: Counter,
    #[metrics(help = "Number of provider records published.")]
    pub provides: Counter,
}
