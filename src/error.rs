use thiserror::Error;

/// Stable error taxonomy surfaced to any caller of the engine (CLI, tests, embedders).
///
/// Every variant carries a `code()` matching the kind enumerated in the spec so a
/// caller can render `{success:false, error:{code, message}}` without re-deriving it.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("telegram error: {0}")]
    Telegram(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("rate limited: method {method} must wait {wait_seconds}s")]
    RateLimited { method: String, wait_seconds: u32 },

    #[error("sql write not allowed: {0}")]
    SqlWriteNotAllowed(String),

    #[error("sql references unknown table: {0}")]
    SqlTableNotFound(String),

    #[error("sql syntax error: {0}")]
    SqlSyntaxError(String),

    #[error("{0}")]
    General(String),

    #[error("daemon is not running")]
    DaemonNotRunning,

    #[error("daemon is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("no accounts configured")]
    NoAccounts,

    #[error("all accounts failed to connect")]
    AllAccountsFailed,

    #[error("pid file io error: {0}")]
    PidIoError(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl EngineError {
    /// Stable machine-readable code, one per kind enumerated in spec §6.4.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidArgs(_) => "INVALID_ARGS",
            EngineError::AuthRequired(_) => "AUTH_REQUIRED",
            EngineError::Network(_) => "NETWORK_ERROR",
            EngineError::Telegram(_) => "TELEGRAM_ERROR",
            EngineError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            EngineError::RateLimited { .. } => "RATE_LIMITED",
            EngineError::SqlWriteNotAllowed(_) => "SQL_WRITE_NOT_ALLOWED",
            EngineError::SqlTableNotFound(_) => "SQL_TABLE_NOT_FOUND",
            EngineError::SqlSyntaxError(_) => "SQL_SYNTAX_ERROR",
            EngineError::General(_) => "GENERAL_ERROR",
            EngineError::DaemonNotRunning => "DAEMON_NOT_RUNNING",
            EngineError::AlreadyRunning(_) => "ALREADY_RUNNING",
            EngineError::NoAccounts => "GENERAL_ERROR",
            EngineError::AllAccountsFailed => "GENERAL_ERROR",
            EngineError::PidIoError(_) => "PID_IO_ERROR",
            EngineError::Sql(_) => "GENERAL_ERROR",
            EngineError::Serialization(_) => "GENERAL_ERROR",
            EngineError::Config(_) => "GENERAL_ERROR",
        }
    }

    /// Process exit code for `daemon start`, per spec §4.9.
    pub fn daemon_exit_code(&self) -> i32 {
        match self {
            EngineError::AlreadyRunning(_) => 2,
            EngineError::NoAccounts => 3,
            EngineError::AllAccountsFailed => 4,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
