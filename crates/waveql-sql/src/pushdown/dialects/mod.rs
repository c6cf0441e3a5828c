// SPDX-License-Identifier: Apache-2.0

//! Native dialect renderers.

pub mod json_filter;
pub mod jql;
pub mod query_string;
pub mod servicenow;
pub mod sql;

use waveql_core::capability::DialectKind;

use super::NativeDialect;

pub use json_filter::JsonFilterDialect;
pub use jql::JqlDialect;
pub use query_string::QueryStringDialect;
pub use servicenow::ServiceNowDialect;
pub use sql::SqlDialect;

static SERVICENOW: ServiceNowDialect = ServiceNowDialect;
static JQL: JqlDialect = JqlDialect;
static QUERY_STRING: QueryStringDialect = QueryStringDialect;
static JSON_FILTER: JsonFilterDialect = JsonFilterDialect;
static SQL: SqlDialect = SqlDialect;

/// Renderer for a dialect kind.
pub fn dialect_for(kind: DialectKind) -> &'static dyn NativeDialect {
    match kind {
        DialectKind::ServiceNow => &SERVICENOW,
        DialectKind::Jql => &JQL,
        DialectKind::QueryString => &QUERY_STRING,
        DialectKind::JsonFilter => &JSON_FILTER,
        DialectKind::Sql => &SQL,
    }
}

/// Classification of a LIKE pattern for dialects without a general LIKE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LikeShape<'a> {
    Exact(&'a str),
    Contains(&'a str),
    StartsWith(&'a str),
    EndsWith(&'a str),
}

pub(crate) fn like_shape(pattern: &str) -> Option<LikeShape<'_>> {
    if pattern.contains('_') {
        return None;
    }
    let leading = pattern.starts_with('%');
    let trailing = pattern.len() > 1 && pattern.ends_with('%');
    let inner = pattern
        .strip_prefix('%')
        .unwrap_or(pattern);
    let inner = if trailing {
        inner.strip_suffix('%').unwrap_or(inner)
    } else {
        inner
    };
    if inner.is_empty() || inner.contains('%') {
        return None;
    }
    Some(match (leading, trailing) {
        (true, true) => LikeShape::Contains(inner),
        (true, false) => LikeShape::EndsWith(inner),
        (false, true) => LikeShape::StartsWith(inner),
        (false, false) => LikeShape::Exact(inner),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_shapes() {
        assert_eq!(like_shape("%net%"), Some(LikeShape::Contains("net")));
        assert_eq!(like_shape("net%"), Some(LikeShape::StartsWith("net")));
        assert_eq!(like_shape("%net"), Some(LikeShape::EndsWith("net")));
        assert_eq!(like_shape("net"), Some(LikeShape::Exact("net")));
        assert_eq!(like_shape("n%t"), None);
        assert_eq!(like_shape("n_t"), None);
        assert_eq!(like_shape("%"), None);
        assert_eq!(like_shape("%%"), None);
    }

    #[test]
    fn every_kind_has_a_renderer() {
        for kind in [
            DialectKind::ServiceNow,
            DialectKind::Jql,
            DialectKind::QueryString,
            DialectKind::JsonFilter,
            DialectKind::Sql,
        ] {
            assert_eq!(dialect_for(kind).kind(), kind);
        }
    }
}
