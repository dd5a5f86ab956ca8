//! Pulls the `window.__NUXT__ = (function(...){...}(...));` hydration payload
//! out of raw page markup.
//!
//! This is a regex over the page text, not an HTML or JavaScript parse. It is
//! tied to how the upstream site currently serializes its state and will stop
//! matching if that markup changes; a miss is reported as an extraction error
//! and is never retried.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

pub const STATE_GLOBAL: &str = "window";
pub const STATE_PROPERTY: &str = "__NUXT__";

// `[\s\S]*?` keeps each part as short as possible, so the match ends at the
// first `}(args));` that closes an invocation.
static RE_NUXT_STATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"window\s*\.\s*__NUXT__\s*=\s*(\(\s*function\s*\([^)]*\)\s*\{[\s\S]*?\}\s*\([\s\S]*?\)\s*\))\s*;",
    )
    .unwrap()
});

/// The invoked-function expression assigned to the state global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedExpression<'a> {
    text: &'a str,
}

impl<'a> EmbeddedExpression<'a> {
    pub fn as_str(&self) -> &'a str {
        self.text
    }

    /// The full statement the sandbox evaluates.
    pub fn assignment(&self) -> String {
        format!("{}.{} = {};", STATE_GLOBAL, STATE_PROPERTY, self.text)
    }
}

pub fn extract_state_expression(html: &str) -> Result<EmbeddedExpression<'_>> {
    let text = RE_NUXT_STATE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| {
            Error::Extraction(format!(
                "{}.{} assignment not found in page ({} bytes); upstream markup may have changed",
                STATE_GLOBAL,
                STATE_PROPERTY,
                html.len()
            ))
        })?;
    tracing::debug!(chars = text.len(), "Found embedded state expression");
    Ok(EmbeddedExpression { text })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_compact_assignment() {
        let html = "<html><script>window.__NUXT__ = (function(a,b){return {data:[{hotArticlesList:[]}]}}(1,2));</script></html>";
        let expr = extract_state_expression(html).unwrap();
        assert_eq!(
            expr.as_str(),
            "(function(a,b){return {data:[{hotArticlesList:[]}]}}(1,2))"
        );
    }

    #[test]
    fn tolerates_whitespace_and_newlines() {
        let html = "<script>\n  window . __NUXT__\n =\n ( function ( a ) {\n return {x:a}\n }\n ( \"v\" )\n ) ;\n</script>";
        let expr = extract_state_expression(html).unwrap();
        assert!(expr.as_str().starts_with("( function"));
        assert!(expr.as_str().ends_with(")\n )"));
    }

    #[test]
    fn stops_at_first_closing_invocation() {
        let html = "<script>window.__NUXT__=(function(a){return {v:a}}(1));</script>\
                    <script>other(function(){}(2));</script>";
        let expr = extract_state_expression(html).unwrap();
        assert_eq!(expr.as_str(), "(function(a){return {v:a}}(1))");
    }

    #[test]
    fn assignment_wraps_expression() {
        let html = "window.__NUXT__=(function(){return 1}());";
        let expr = extract_state_expression(html).unwrap();
        assert_eq!(expr.assignment(), "window.__NUXT__ = (function(){return 1}());");
    }

    #[test]
    fn missing_assignment_is_an_extraction_error() {
        let html = "<html><script>window.__INITIAL_STATE__ = {};</script></html>";
        let err = extract_state_expression(html).unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn plain_object_assignment_is_not_accepted() {
        let html = "<script>window.__NUXT__ = {data: []};</script>";
        assert!(extract_state_expression(html).is_err());
    }
}
