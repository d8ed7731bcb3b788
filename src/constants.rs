pub mod auth {
    pub const TOKEN_ENDPOINT: &str = "/api/token";
    pub const TOKEN_REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const TOKEN_EXPIRY_BUFFER_SECS: i64 = 60;
    pub const APPLICATION_NAME: &str = "ems-gateway";
    pub const USER_AGENT: &str = "ems-api-sdk rust ems-gateway/0.2.0";
}

pub mod retry {
    pub const MAX_RETRIES: u32 = 3;
    pub const BASE_DELAY_SECS: f64 = 1.0;
    pub const MAX_DELAY_SECS: f64 = 30.0;
    pub const EXPONENTIAL_BASE: f64 = 2.0;
}

pub mod cache {
    pub const DEFAULT_TTL_SECS: u64 = 3_600;
    pub const MAX_ENTRIES: usize = 10_000;
}

pub mod discovery {
    pub const STORE_MAX_ENTRIES: usize = 500;
    pub const DEFAULT_MAX_DEPTH: usize = 5;
    pub const MAX_DEPTH_CAP: usize = 10;
    pub const DEFAULT_MAX_RESULTS: usize = 50;
    pub const MAX_RESULTS_CAP: usize = 50;
    pub const DEFAULT_MAX_GROUPS: usize = 50;
    pub const MAX_GROUPS_CAP: usize = 200;
    pub const SAMPLE_NAME_LIMIT: usize = 10;
    pub const AMBIGUOUS_NAME_LIMIT: usize = 5;
}

pub mod query {
    pub const MAX_FLIGHTS_PER_REQUEST: usize = 10;
    pub const MAX_ANALYTICS_PER_REQUEST: usize = 20;
    pub const DEFAULT_SAMPLE_RATE: f64 = 1.0;
    pub const DEFAULT_SAMPLE_SIZE: u64 = 5_000;
    pub const MAX_ROWS_PER_FLIGHT: usize = 200;
    pub const DEFAULT_QUERY_LIMIT: u64 = 100;
    pub const MAX_QUERY_LIMIT: u64 = 10_000;
}

pub mod markers {
    pub const ENTITY_TYPE: &str = "[entity-type]";
    pub const ENTITY_TYPE_GROUP: &str = "[entity-type-group]";
    pub const COMPRESSED_ID_PREFIX: &str = "H4sIA";
    pub const HUB_ID_PREFIX: &str = "[-hub-]";
}

pub mod network {
    pub const REQUEST_TIMEOUT_SECS: u64 = 120;
}
