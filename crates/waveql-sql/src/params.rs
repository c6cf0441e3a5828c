// SPDX-License-Identifier: Apache-2.0

//! Positional `?` parameters.
//!
//! A parameterized statement is kept as tokens. Binding renders every slot
//! as an escaped SQL literal and compiles the bound text, so values never
//! reach the parser as raw SQL.

use sqlparser::ast::Value as SqlValue;
use sqlparser::tokenizer::Token;

use waveql_core::error::{EngineError, EngineResult};
use waveql_core::predicate::Literal;

use crate::ast::CompiledQuery;
use crate::compiler::{compile, token_text, tokenize};

#[derive(Debug, Clone)]
pub struct ParameterizedQuery {
    sql: String,
    tokens: Vec<Token>,
    params: usize,
}

impl ParameterizedQuery {
    pub fn parse(sql: &str) -> EngineResult<Self> {
        let sql = sql.trim();
        let tokens = tokenize(sql)?;
        let mut params = 0;
        for token in &tokens {
            if let Token::Placeholder(text) = token {
                if text != "?" {
                    return Err(EngineError::syntax_at(
                        "only positional ? parameters are supported",
                        text.clone(),
                    ));
                }
                params += 1;
            }
        }
        Ok(Self {
            sql: sql.to_string(),
            tokens,
            params,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.params
    }

    /// Substitutes `params` into the slots, in order, and compiles the result.
    pub fn bind(&self, params: &[Literal]) -> EngineResult<CompiledQuery> {
        if params.len() != self.params {
            return Err(EngineError::query_error(format!(
                "statement takes {} parameters, {} given",
                self.params,
                params.len()
            )));
        }

        let mut values = params.iter();
        let mut text = String::with_capacity(self.sql.len() + 8 * params.len());
        for token in &self.tokens {
            match token {
                Token::Placeholder(_) => {
                    let value = values
                        .next()
                        .ok_or_else(|| EngineError::internal("parameter slots out of step"))?;
                    text.push_str(&literal_sql(value)?);
                }
                Token::EOF => {}
                other => text.push_str(&token_text(other)),
            }
        }
        compile(&text)
    }
}

/// SQL spelling of a bound value. Negative numbers are parenthesized so a
/// preceding `-` cannot turn them into a comment.
fn literal_sql(literal: &Literal) -> EngineResult<String> {
    let text = match literal {
        Literal::Null => "NULL".to_string(),
        Literal::Bool(true) => "TRUE".to_string(),
        Literal::Bool(false) => "FALSE".to_string(),
        Literal::Int(i) if *i < 0 => format!("({i})"),
        Literal::Int(i) => i.to_string(),
        Literal::Float(f) if !f.is_finite() => {
            return Err(EngineError::query_error(format!("{f} cannot be bound as a parameter")));
        }
        Literal::Float(f) => {
            // Whole floats keep a fraction so they stay floats.
            let digits = if f.fract() == 0.0 { format!("{f:.1}") } else { f.to_string() };
            if *f < 0.0 {
                format!("({digits})")
            } else {
                digits
            }
        }
        Literal::String(s) => SqlValue::SingleQuotedString(s.clone()).to_string(),
        Literal::Timestamp(ts) => format!("TIMESTAMP '{}'", ts.format("%Y-%m-%d %H:%M:%S%.f")),
    };
    Ok(text)
}
