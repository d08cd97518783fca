//! Validated identifiers.
//!
//! Two kinds of user-supplied values end up inside SQL text that the engine
//! cannot parameterize:
//!
//! - tenant tokens, carried into the transaction-local `app.tenant_id` setting;
//! - namespace (schema) and table names, used in DDL such as `CREATE SCHEMA`.
//!
//! Both are validated here, before any I/O, and every quoted identifier in the
//! crate is produced by [`SqlIdent::quoted`] or [`NamespaceName::quoted`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// `PostgreSQL` truncates identifiers longer than this (`NAMEDATALEN - 1`).
pub const MAX_IDENT_LEN: usize = 63;

/// Namespaces that must never be provisioned, migrated or dropped by this crate.
const RESERVED_NAMESPACES: &[&str] = &["public", "information_schema"];

/// Prefix the engine reserves for its own catalog schemas.
const RESERVED_PREFIX: &str = "pg_";

/// What kind of identifier failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentKind {
    Tenant,
    Namespace,
    Table,
}

impl fmt::Display for IdentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tenant => "tenant identifier",
            Self::Namespace => "namespace name",
            Self::Table => "table name",
        })
    }
}

/// A token or name was rejected before reaching the database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} '{value}': {reason}")]
pub struct InvalidIdentifier {
    pub kind: IdentKind,
    pub value: String,
    pub reason: &'static str,
}

impl InvalidIdentifier {
    fn new(kind: IdentKind, value: &str, reason: &'static str) -> Self {
        // Keep error messages bounded; rejected input can be arbitrarily long.
        let value = value.chars().take(80).collect();
        Self {
            kind,
            value,
            reason,
        }
    }
}

/// Check a tenant token against the canonical UUID grammar.
///
/// Accepted form: `xxxxxxxx-xxxx-Vxxx-Nxxx-xxxxxxxxxxxx` (hex digits, either
/// case), with version nibble `V` in `1..=8` and variant nibble `N` in
/// `8, 9, a, b`. Braced, URN and hyphen-less forms are rejected.
///
/// # Errors
/// Returns [`InvalidIdentifier`] describing the first deviation found.
pub fn validate_tenant_token(token: &str) -> Result<(), InvalidIdentifier> {
    const HYPHENS: [usize; 4] = [8, 13, 18, 23];
    const VERSION_AT: usize = 14;
    const VARIANT_AT: usize = 19;

    let reject = |reason| Err(InvalidIdentifier::new(IdentKind::Tenant, token, reason));

    let bytes = token.as_bytes();
    if bytes.len() != 36 {
        return reject("expected 36 characters in 8-4-4-4-12 form");
    }

    for (i, b) in bytes.iter().enumerate() {
        if HYPHENS.contains(&i) {
            if *b != b'-' {
                return reject("hyphens must separate 8-4-4-4-12 hex groups");
            }
        } else if !b.is_ascii_hexdigit() {
            return reject("only hexadecimal digits are allowed");
        }
    }

    if !matches!(bytes[VERSION_AT], b'1'..=b'8') {
        return reject("unsupported UUID version nibble");
    }
    if !matches!(bytes[VARIANT_AT], b'8' | b'9' | b'a' | b'b' | b'A' | b'B') {
        return reject("unsupported UUID variant nibble");
    }

    Ok(())
}

/// A tenant identifier that passed [`validate_tenant_token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(Uuid);

impl TenantId {
    /// Parse and validate a tenant token.
    ///
    /// # Errors
    /// Returns [`InvalidIdentifier`] if the token is not a canonical UUID.
    pub fn parse(token: &str) -> Result<Self, InvalidIdentifier> {
        validate_tenant_token(token)?;
        Uuid::parse_str(token)
            .map(Self)
            .map_err(|_| InvalidIdentifier::new(IdentKind::Tenant, token, "not a UUID"))
    }

    /// Wrap an already-typed UUID, applying the same version/variant rules.
    ///
    /// # Errors
    /// Returns [`InvalidIdentifier`] for the nil UUID or unsupported versions.
    pub fn from_uuid(id: Uuid) -> Result<Self, InvalidIdentifier> {
        Self::parse(&id.hyphenated().to_string())
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for TenantId {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.to_string()
    }
}

fn check_ident(kind: IdentKind, name: &str) -> Result<(), InvalidIdentifier> {
    if name.is_empty() {
        return Err(InvalidIdentifier::new(kind, name, "must not be empty"));
    }
    if name.len() > MAX_IDENT_LEN {
        return Err(InvalidIdentifier::new(
            kind,
            name,
            "must be at most 63 characters",
        ));
    }

    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !first_ok {
        return Err(InvalidIdentifier::new(
            kind,
            name,
            "must start with a letter or underscore",
        ));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(InvalidIdentifier::new(
            kind,
            name,
            "only letters, digits and underscores are allowed",
        ));
    }
    Ok(())
}

fn quote(name: &str) -> String {
    // Validated names never contain quotes; doubling keeps the helper total anyway.
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A plain SQL identifier (table or column name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SqlIdent(String);

impl SqlIdent {
    /// # Errors
    /// Returns [`InvalidIdentifier`] if the name breaks the identifier rules.
    pub fn parse(name: &str) -> Result<Self, InvalidIdentifier> {
        check_ident(IdentKind::Table, name)?;
        Ok(Self(name.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form, safe to splice into SQL text.
    #[must_use]
    pub fn quoted(&self) -> String {
        quote(&self.0)
    }
}

impl fmt::Display for SqlIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SqlIdent {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SqlIdent> for String {
    fn from(value: SqlIdent) -> Self {
        value.0
    }
}

/// Name of a tenant namespace (a `PostgreSQL` schema).
///
/// Same rules as [`SqlIdent`], and additionally never one of the engine's own
/// schemas: `public`, `information_schema` or anything starting with `pg_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamespaceName(String);

impl NamespaceName {
    /// # Errors
    /// Returns [`InvalidIdentifier`] if the name is malformed or reserved.
    pub fn parse(name: &str) -> Result<Self, InvalidIdentifier> {
        check_ident(IdentKind::Namespace, name)?;
        if is_system_namespace(name) {
            return Err(InvalidIdentifier::new(
                IdentKind::Namespace,
                name,
                "reserved system namespace",
            ));
        }
        Ok(Self(name.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form, safe to splice into SQL text.
    #[must_use]
    pub fn quoted(&self) -> String {
        quote(&self.0)
    }

    /// `"<namespace>"."<table>"`.
    #[must_use]
    pub fn qualify(&self, table: &SqlIdent) -> String {
        format!("{}.{}", self.quoted(), table.quoted())
    }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NamespaceName {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NamespaceName {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NamespaceName> for String {
    fn from(value: NamespaceName) -> Self {
        value.0
    }
}

/// `true` for schemas owned by the engine rather than by tenants.
///
/// Used both to refuse such names on input and to exclude them from orphan
/// detection.
#[must_use]
pub fn is_system_namespace(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    RESERVED_NAMESPACES.contains(&lower.as_str()) || lower.starts_with(RESERVED_PREFIX)
}
