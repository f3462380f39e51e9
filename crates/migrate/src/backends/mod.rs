//! Store Backends
//!
//! The engine runs against any [`MigrationStore`]. PostgreSQL is the
//! production backend; the memory backend holds an in-process catalog and is
//! used for tests and rehearsals.

pub mod core;
pub mod memory;
pub mod pg_sql;
pub mod postgres;

// Re-export core traits and types
pub use self::core::*;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Store backend type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseBackendType {
    PostgreSQL,
    Memory,
}

impl std::fmt::Display for DatabaseBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseBackendType::PostgreSQL => write!(f, "postgresql"),
            DatabaseBackendType::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for DatabaseBackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DatabaseBackendType::PostgreSQL),
            "memory" => Ok(DatabaseBackendType::Memory),
            _ => Err(format!("Unsupported store backend: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_type_round_trips_through_str() {
        assert_eq!("postgres".parse::<DatabaseBackendType>(), Ok(DatabaseBackendType::PostgreSQL));
        assert_eq!("Memory".parse::<DatabaseBackendType>(), Ok(DatabaseBackendType::Memory));
        assert!("mysql".parse::<DatabaseBackendType>().is_err());
        assert_eq!(DatabaseBackendType::PostgreSQL.to_string(), "postgresql");
    }
}
