use clap::Parser;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://heartline.db?mode=rwc";
pub const DEFAULT_MAX_DB_CONNECTIONS: u32 = 16;
pub const DEFAULT_OUTBOUND_QUEUE: usize = 32;
pub const DEFAULT_HUB_BUFFER: usize = 256;
pub const DEFAULT_TASK_QUEUE: usize = 1024;

/// Heartline chat server
#[derive(Parser, Clone, Debug)]
#[command(name = "heartline", version, about = "Heartline chat server")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "HEARTLINE_BIND_ADDRESS", default_value = DEFAULT_BIND_ADDRESS)]
    pub bind_address: String,

    /// sqlite database holding chat messages
    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    pub database_url: String,

    #[arg(long, env = "HEARTLINE_MAX_DB_CONNECTIONS", default_value_t = DEFAULT_MAX_DB_CONNECTIONS)]
    pub max_db_connections: u32,

    /// Messages buffered per client before it is evicted as a slow consumer
    #[arg(long, env = "HEARTLINE_OUTBOUND_QUEUE", default_value_t = DEFAULT_OUTBOUND_QUEUE)]
    pub outbound_queue: usize,

    /// Pending commands the connection hub buffers
    #[arg(long, env = "HEARTLINE_HUB_BUFFER", default_value_t = DEFAULT_HUB_BUFFER)]
    pub hub_buffer: usize,

    /// Pending read-receipt tasks buffered before new ones are dropped
    #[arg(long, env = "HEARTLINE_TASK_QUEUE", default_value_t = DEFAULT_TASK_QUEUE)]
    pub task_queue: usize,

    /// Emit logs as JSON
    #[arg(long, env = "HEARTLINE_JSON_LOGS")]
    pub json_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_db_connections: DEFAULT_MAX_DB_CONNECTIONS,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            hub_buffer: DEFAULT_HUB_BUFFER,
            task_queue: DEFAULT_TASK_QUEUE,
            json_logs: false,
        }
    }
}
