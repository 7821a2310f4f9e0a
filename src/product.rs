//! Product identity: the immutable record a host application supplies so its
//! licenses can be validated.
//!
//! The engine only ever reads a `Product`. Hosts usually build one at startup
//! with the public key published by their license authority.

use std::fmt;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::errors::{LicenseError, LicenseResult};

/// Opaque verification key published by the license authority.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> LicenseResult<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(LicenseError::InvalidProduct(
                "public key cannot be empty".to_string(),
            ));
        }
        Ok(Self(bytes))
    }

    pub fn from_base64(encoded: &str) -> LicenseResult<Self> {
        let bytes = B64.decode(encoded.trim()).map_err(|e| {
            LicenseError::InvalidProduct(format!("public key is not valid base64: {e}"))
        })?;
        Self::from_bytes(bytes)
    }

    pub fn from_hex(encoded: &str) -> LicenseResult<Self> {
        let bytes = hex::decode(encoded.trim()).map_err(|e| {
            LicenseError::InvalidProduct(format!("public key is not valid hex: {e}"))
        })?;
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short hex fingerprint used in log lines.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(8)])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

/// Edition of the product the installation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProductVariant {
    /// The variant is determined by the license being validated.
    #[default]
    LicenseProvided,
    Trial,
    Standard,
    Professional,
    Enterprise,
}

impl ProductVariant {
    /// Human readable suffix used when rendering the product name.
    pub fn description(&self) -> &'static str {
        match self {
            ProductVariant::LicenseProvided => "",
            ProductVariant::Trial => "Trial",
            ProductVariant::Standard => "Standard",
            ProductVariant::Professional => "Professional",
            ProductVariant::Enterprise => "Enterprise",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductVersion(String);

impl ProductVersion {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self(identifier.into())
    }

    pub fn identifier(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store that sells licenses for the product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Store {
    pub name: String,
    pub url: String,
}

/// Information required from a product to validate its licenses, both online
/// and offline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Product {
    id: u64,
    name: String,
    public_key: PublicKey,
    variant: ProductVariant,
    version: ProductVersion,
    store: Option<Store>,
}

impl Product {
    /// Build a product record.
    ///
    /// A `None` variant means the variant is determined by the license.
    pub fn new(
        id: u64,
        name: impl Into<String>,
        public_key: PublicKey,
        variant: Option<ProductVariant>,
        version: ProductVersion,
        store: Option<Store>,
    ) -> LicenseResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(LicenseError::InvalidProduct(
                "product name cannot be blank".to_string(),
            ));
        }
        if version.identifier().trim().is_empty() {
            return Err(LicenseError::InvalidProduct(format!(
                "version of product '{name}' cannot be blank"
            )));
        }

        Ok(Self {
            id,
            name,
            public_key,
            variant: variant.unwrap_or_default(),
            version,
            store,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn variant(&self) -> ProductVariant {
        self.variant
    }

    pub fn version(&self) -> &ProductVersion {
        &self.version
    }

    pub fn store(&self) -> Option<&Store> {
        self.store.as_ref()
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = self.variant.description();
        if description.is_empty() {
            write!(f, "{} {}", self.name, self.version)
        } else {
            write!(f, "{} {} {}", self.name, description, self.version)
        }
    }
}
