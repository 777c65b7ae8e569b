use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Constantes de ajuste de la cola y de los listeners.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Capacidad de la cola viva
    pub queue_cap: usize,
    /// Largo objetivo tras una pasada de GC
    pub gc_target: usize,
    /// Si la cola tiene a lo sumo esto, se intenta recoger del backlog
    pub gc_pickup_threshold: usize,
    /// Cuántas tareas del backlog se recogen por pasada
    pub gc_pickup_count: usize,
    /// Ventana en la que una consulta de estado mantiene viva una tarea
    pub keep_alive: Duration,
    pub group_limit: usize,
    pub worker_slots: usize,
    pub cleanup_interval: Duration,
    pub group_listener_timeout: Duration,
    pub token_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_cap: 40,
            gc_target: 20,
            gc_pickup_threshold: 4,
            gc_pickup_count: 4,
            keep_alive: Duration::from_secs(5),
            group_limit: 4,
            worker_slots: 2,
            cleanup_interval: Duration::from_secs(30),
            group_listener_timeout: Duration::from_secs(60),
            token_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Bases de URL de los dos buckets (privado para fuentes, público para máscaras).
#[derive(Debug, Clone)]
pub struct StorageUrls {
    pub private_base: String,
    pub public_base: String,
    /// Base pública que ven los clientes finales
    pub public_exposed_base: String,
}

impl Default for StorageUrls {
    fn default() -> Self {
        Self {
            private_base: "http://localhost:8787/private".to_string(),
            public_base: "http://localhost:8787/public".to_string(),
            public_exposed_base: "http://localhost:8787/public".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub worker_secret: String,
    /// Clave privada ES256 en PEM (PKCS#8)
    pub jwt_private_key: String,
    pub urls: StorageUrls,
    /// Sin base de datos se usan los adaptadores en memoria
    pub database_url: Option<String>,
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("falta la variable de entorno {0}")]
    Missing(&'static str),
    #[error("valor inválido para {name}: {value}")]
    Invalid { name: &'static str, value: String },
    #[error("no se pudo leer {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Config {
    /// Lee la configuración desde variables de entorno.
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_addr = parse_or("LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?;

        let worker_secret =
            env::var("MIT_WORKERS_SECRET").map_err(|_| ConfigError::Missing("MIT_WORKERS_SECRET"))?;

        let jwt_private_key = match env::var("JWT_PRIVATE_KEY") {
            Ok(pem) => pem,
            Err(_) => {
                let path = env::var("JWT_PRIVATE_KEY_FILE")
                    .map_err(|_| ConfigError::Missing("JWT_PRIVATE_KEY"))?;
                std::fs::read_to_string(&path).map_err(|source| ConfigError::Io { path, source })?
            }
        };

        let defaults = StorageUrls::default();
        let public_base = env::var("WKR2_PUBLIC_BASE").unwrap_or(defaults.public_base);
        let urls = StorageUrls {
            private_base: env::var("WKR2_PRIVATE_BASE").unwrap_or(defaults.private_base),
            public_exposed_base: env::var("WKR2_PUBLIC_EXPOSED_BASE")
                .unwrap_or_else(|_| public_base.clone()),
            public_base,
        };

        let base = CoordinatorConfig::default();
        let coordinator = CoordinatorConfig {
            queue_cap: parse_or("QUEUE_CAP", base.queue_cap)?,
            gc_target: parse_or("QUEUE_GC_TARGET", base.gc_target)?,
            gc_pickup_threshold: parse_or("QUEUE_GC_PICKUP", base.gc_pickup_threshold)?,
            gc_pickup_count: parse_or("QUEUE_GC_PICKUP_COUNT", base.gc_pickup_count)?,
            group_limit: parse_or("TASK_GROUP_LIMIT", base.group_limit)?,
            ..base
        };

        if coordinator.gc_target > coordinator.queue_cap {
            return Err(ConfigError::Invalid {
                name: "QUEUE_GC_TARGET",
                value: coordinator.gc_target.to_string(),
            });
        }

        Ok(Self {
            listen_addr,
            worker_secret,
            jwt_private_key,
            urls,
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            coordinator,
        })
    }
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}
