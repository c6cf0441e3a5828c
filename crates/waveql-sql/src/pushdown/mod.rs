// SPDX-License-Identifier: Apache-2.0

//! Predicate pushdown translation.
//!
//! Splits a predicate into the part a source evaluates natively (rendered in
//! its dialect) and a residual evaluated locally. The split is conjunctive:
//! `pushed AND residual` is equivalent to the input. Disjunctions and
//! negations are pushed whole or not at all.

pub mod dialects;

use serde::{Deserialize, Serialize};
use tracing::debug;

use waveql_core::capability::{Capability, DialectKind};
use waveql_core::predicate::{Literal, Predicate};
use waveql_core::traits::NativeQueryFragment;

pub use dialects::dialect_for;

/// A query language a source understands.
pub trait NativeDialect: Send + Sync {
    fn kind(&self) -> DialectKind;

    /// Renders a predicate, or `None` when the dialect cannot express it
    /// exactly.
    fn render(&self, predicate: &Predicate) -> Option<String>;

    /// Renders a single literal value.
    fn render_literal(&self, literal: &Literal) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushedFilter {
    pub predicate: Predicate,
    pub fragment: NativeQueryFragment,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TranslatedFilter {
    pub pushed: Option<PushedFilter>,
    pub residual: Option<Predicate>,
}

impl TranslatedFilter {
    /// Nothing pushed; the whole predicate stays local.
    pub fn local(predicate: Option<Predicate>) -> Self {
        Self {
            pushed: None,
            residual: predicate,
        }
    }

    pub fn fragment(&self) -> Option<&NativeQueryFragment> {
        self.pushed.as_ref().map(|p| &p.fragment)
    }

    pub fn pushed_predicate(&self) -> Option<&Predicate> {
        self.pushed.as_ref().map(|p| &p.predicate)
    }
}

/// Translates `predicate` for a source with `capability`.
pub fn translate(predicate: &Predicate, capability: &Capability) -> TranslatedFilter {
    let dialect = dialect_for(capability.dialect);

    let mut pushable = Vec::new();
    let mut residual = Vec::new();
    for conjunct in predicate.conjuncts() {
        if supported(conjunct, capability) && dialect.render(conjunct).is_some() {
            pushable.push(conjunct.clone());
        } else {
            residual.push(conjunct.clone());
        }
    }

    let pushed = Predicate::conjoin(pushable.clone()).and_then(|predicate| {
        dialect.render(&predicate).map(|text| PushedFilter {
            fragment: NativeQueryFragment {
                text,
                encoding: capability.encoding.clone(),
            },
            predicate,
        })
    });

    if pushed.is_none() && !pushable.is_empty() {
        // Conjuncts render individually but not together: keep everything local.
        residual = predicate.conjuncts().into_iter().cloned().collect();
    }

    let translated = TranslatedFilter {
        pushed,
        residual: Predicate::conjoin(residual),
    };
    debug!(
        dialect = ?capability.dialect,
        pushed = translated.fragment().map(|f| f.text.as_str()),
        residual = translated.residual.as_ref().map(|r| r.to_string()),
        "Translated predicate"
    );
    translated
}

/// Every leaf's shape is declared on its column, and IN lists fit the limit.
fn supported(predicate: &Predicate, capability: &Capability) -> bool {
    match predicate {
        Predicate::And(parts) | Predicate::Or(parts) => {
            parts.iter().all(|p| supported(p, capability))
        }
        Predicate::Not(inner) => supported(inner, capability),
        Predicate::In { values, .. } if values.len() > capability.max_in_list => false,
        leaf => match (leaf.shape(), leaf.columns().first()) {
            (Some(shape), Some(column)) => capability.supports(shape, &column.dotted()),
            _ => false,
        },
    }
}
