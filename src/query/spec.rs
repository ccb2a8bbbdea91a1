//! Parameterized query specifications
//!
//! A [`QuerySpec`] keeps literal query text and bound values apart. Literal
//! text comes either from `&'static str` fragments compiled into the binary,
//! or through [`QuerySpec::push_dynamic`], which records where the text came
//! from. Values only enter through [`QuerySpec::bind`], which emits a
//! placeholder.
//!
//! ```text
//! QuerySpec::read(tenant)
//!     .sql("SELECT name FROM ").ident("pupils")
//!     .sql(" WHERE class = ").bind("7B")      ──► SELECT name FROM pupils WHERE class = ?
//!                                                 params: ["7B"]
//! ```

use crate::tenant::TenantId;
use serde::Serialize;

/// Where dynamically assembled literal text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Server-side values such as configuration or schema metadata
    Trusted,
    /// Anything derived from request data or stored user content
    Untrusted,
}

/// Operation class, which selects the execution ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Read,
    Write,
    Report,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Report => "report",
        }
    }
}

/// A bound parameter value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Fragment {
    Static(&'static str),
    Dynamic { text: String, origin: Origin },
    Ident(String),
    Placeholder,
}

/// Query text plus bound parameters, owned by one tenant.
///
/// Deliberately not `Deserialize`: a spec can only be built in code.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    tenant_id: TenantId,
    class: OperationClass,
    fragments: Vec<Fragment>,
    params: Vec<SqlValue>,
}

impl QuerySpec {
    pub fn new(tenant_id: TenantId, class: OperationClass) -> Self {
        Self {
            tenant_id,
            class,
            fragments: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn read(tenant_id: TenantId) -> Self {
        Self::new(tenant_id, OperationClass::Read)
    }

    pub fn write(tenant_id: TenantId) -> Self {
        Self::new(tenant_id, OperationClass::Write)
    }

    pub fn report(tenant_id: TenantId) -> Self {
        Self::new(tenant_id, OperationClass::Report)
    }

    /// Append compile-time literal text
    pub fn sql(mut self, text: &'static str) -> Self {
        self.fragments.push(Fragment::Static(text));
        self
    }

    /// Append runtime literal text, recording its origin
    pub fn push_dynamic(mut self, text: impl Into<String>, origin: Origin) -> Self {
        self.fragments.push(Fragment::Dynamic {
            text: text.into(),
            origin,
        });
        self
    }

    /// Append a table or column name, checked by the guard
    pub fn ident(mut self, name: impl Into<String>) -> Self {
        self.fragments.push(Fragment::Ident(name.into()));
        self
    }

    /// Bind a value as the next positional parameter
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.fragments.push(Fragment::Placeholder);
        self.params.push(value.into());
        self
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn class(&self) -> OperationClass {
        self.class
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub(crate) fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Query text with `?` placeholders
    pub fn text(&self) -> String {
        let mut out = String::new();
        for fragment in &self.fragments {
            match fragment {
                Fragment::Static(s) => out.push_str(s),
                Fragment::Dynamic { text, .. } => out.push_str(text),
                Fragment::Ident(name) => out.push_str(name),
                Fragment::Placeholder => out.push('?'),
            }
        }
        out
    }

    /// Literal text that did not come from the binary or trusted sources
    pub fn untrusted_literals(&self) -> impl Iterator<Item = &str> {
        self.fragments.iter().filter_map(|f| match f {
            Fragment::Dynamic {
                text,
                origin: Origin::Untrusted,
            } => Some(text.as_str()),
            _ => None,
        })
    }
}
