pub mod types;
pub mod config;
pub mod db;
pub mod registry;
pub mod dedup;
pub mod parser;
pub mod fetcher;
pub mod translation;
pub mod providers;
pub mod render;
pub mod events;
pub mod dispatcher;
pub mod scheduler;
pub mod relay;
pub mod discord;

pub use types::*;
pub use config::{Credentials, FetchConfig, ProviderKind, RelayConfig, RemovalPolicy};
pub use db::Database;
pub use registry::SubscriptionRegistry;
pub use dedup::DedupStore;
pub use fetcher::HttpFetcher;
pub use translation::{CircuitBreaker, TranslationGateway, Translator};
pub use dispatcher::DeliveryDispatcher;
pub use scheduler::{PairState, Scheduler};
pub use relay::{FeedRelay, FeedRelayBuilder};
pub use discord::DiscordSender;
