//! Tokens de capacidad para el storage de objetos.
//!
//! Un worker nunca recibe credenciales permanentes: por cada tarea se le
//! firman dos tokens ES256 de vida corta, uno para leer la imagen fuente
//! y otro para subir la máscara. El storage valida firma, audiencia,
//! vencimiento y que el path + verbo pedidos estén dentro del permiso.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ISSUER: &str = "wk:gateway:mit";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("clave inválida: {0}")]
    Key(#[source] jsonwebtoken::errors::Error),
    #[error("token inválido: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("el token no otorga archivos ni directorios")]
    EmptyGrant,
    #[error("verbo {0} no permitido")]
    VerbNotAllowed(Verb),
    #[error("path {0} fuera del alcance del token")]
    PathNotAllowed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verb::Get => write!(f, "GET"),
            Verb::Put => write!(f, "PUT"),
            Verb::Delete => write!(f, "DELETE"),
        }
    }
}

/// Superficie de storage a la que apunta el token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Private,
    Public,
}

impl Audience {
    pub fn as_str(self) -> &'static str {
        match self {
            Audience::Private => "wk:r2:private",
            Audience::Public => "wk:r2:public",
        }
    }
}

/// Qué puede hacer el portador: archivos exactos (`f`), prefijos (`d`) y verbos (`p`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub f: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub d: Vec<String>,
    pub p: Vec<Verb>,
}

impl Grant {
    pub fn file(path: impl Into<String>, verb: Verb) -> Self {
        Self {
            f: vec![path.into()],
            d: Vec::new(),
            p: vec![verb],
        }
    }

    fn allows_path(&self, path: &str) -> bool {
        self.f.iter().any(|f| f == path)
            || self
                .d
                .iter()
                .any(|d| d.ends_with('/') && path.starts_with(d.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityClaims {
    #[serde(flatten)]
    pub grant: Grant,
    pub aud: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Firma tokens con la clave privada; la clave se parsea una sola vez.
#[derive(Debug)]
pub struct TokenIssuer {
    private_key_pem: String,
    key: OnceCell<EncodingKey>,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(private_key_pem: impl Into<String>, ttl: Duration) -> Self {
        Self {
            private_key_pem: private_key_pem.into(),
            key: OnceCell::new(),
            ttl,
        }
    }

    fn key(&self) -> Result<&EncodingKey, TokenError> {
        self.key.get_or_try_init(|| {
            EncodingKey::from_ec_pem(self.private_key_pem.as_bytes()).map_err(TokenError::Key)
        })
    }

    pub fn issue(&self, grant: Grant, audience: Audience) -> Result<String, TokenError> {
        let iat = Utc::now().timestamp();
        let claims = CapabilityClaims {
            grant,
            aud: audience.as_str().to_string(),
            iss: ISSUER.to_string(),
            iat,
            exp: iat + self.ttl.as_secs() as i64,
        };
        self.sign(&claims)
    }

    pub(crate) fn sign(&self, claims: &CapabilityClaims) -> Result<String, TokenError> {
        Ok(encode(&Header::new(Algorithm::ES256), claims, self.key()?)?)
    }
}

/// Verificación del lado del storage (una instancia por audiencia).
pub struct CapabilityVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl CapabilityVerifier {
    pub fn new(public_key_pem: &str, audience: Audience) -> Result<Self, TokenError> {
        let key = DecodingKey::from_ec_pem(public_key_pem.as_bytes()).map_err(TokenError::Key)?;
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&[audience.as_str()]);
        validation.leeway = 0;
        Ok(Self { key, validation })
    }

    pub fn verify(&self, token: &str, path: &str, verb: Verb) -> Result<CapabilityClaims, TokenError> {
        let claims = decode::<CapabilityClaims>(token, &self.key, &self.validation)?.claims;

        if claims.grant.f.is_empty() && claims.grant.d.is_empty() {
            return Err(TokenError::EmptyGrant);
        }
        if !claims.grant.p.contains(&verb) {
            return Err(TokenError::VerbNotAllowed(verb));
        }
        if !claims.grant.allows_path(path) {
            return Err(TokenError::PathNotAllowed(path.to_string()));
        }
        Ok(claims)
    }
}
