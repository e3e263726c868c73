pub mod schema;

pub use schema::{Config, GatewayConfig, GenerationConfig, HistoryConfig, PersonaConfig};
