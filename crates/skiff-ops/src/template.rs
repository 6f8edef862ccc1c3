//! Template rendering seam.
//!
//! The template operations treat rendering as a pure function from
//! template text and a context to bytes. The built-in engine only
//! expands `${var}` references; a richer engine can be plugged in by
//! the frontend without the operations noticing.

use crate::error::OpError;
use std::collections::BTreeMap;

/// Renders template text with a string context.
pub trait TemplateEngine {
    /// Renders the template. Undefined variable references are
    /// errors; silent empty expansion hides typos in deploys.
    fn render(
        &self,
        source_name: &str,
        template: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, OpError>;
}

/// The built-in engine: expands `${name}` references from the
/// context. `$$` escapes a literal dollar sign.
#[derive(Debug, Default, Clone, Copy)]
pub struct VarExpand;

impl TemplateEngine for VarExpand {
    fn render(
        &self,
        source_name: &str,
        template: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, OpError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            if let Some(after) = after.strip_prefix('$') {
                out.push('$');
                rest = after;
            } else if let Some(after) = after.strip_prefix('{') {
                let Some(end) = after.find('}') else {
                    return Err(OpError::Template {
                        source_name: source_name.to_owned(),
                        message: "unterminated '${' reference".to_owned(),
                    });
                };
                let name = &after[..end];
                let Some(value) = context.get(name) else {
                    return Err(OpError::Template {
                        source_name: source_name.to_owned(),
                        message: format!("'{name}' is undefined"),
                    });
                };
                out.push_str(value);
                rest = &after[end + 1..];
            } else {
                out.push('$');
                rest = after;
            }
        }
        out.push_str(rest);
        Ok(out.into_bytes())
    }
}

/// Expands `${var}` references in a single string value using
/// [`VarExpand`]; used for operation arguments in deploy scripts.
pub fn expand_str(
    source_name: &str,
    value: &str,
    context: &BTreeMap<String, String>,
) -> Result<String, OpError> {
    let bytes = VarExpand.render(source_name, value, context)?;
    String::from_utf8(bytes).map_err(|_| OpError::Template {
        source_name: source_name.to_owned(),
        message: "expansion produced invalid UTF-8".to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_expand_reference() {
        let rendered = VarExpand
            .render("<inline>", "server ${host};\n", &ctx(&[("host", "web1")]))
            .unwrap();
        assert_eq!(rendered, b"server web1;\n");
    }

    #[test]
    fn test_undefined_reference_is_error() {
        let err = VarExpand
            .render("site.conf", "listen ${port};", &ctx(&[]))
            .unwrap_err();
        match err {
            OpError::Template {
                source_name,
                message,
            } => {
                assert_eq!(source_name, "site.conf");
                assert!(message.contains("port"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_dollar_escape() {
        let rendered = VarExpand
            .render("<inline>", "cost: $$5, path: $HOME", &ctx(&[]))
            .unwrap();
        assert_eq!(rendered, b"cost: $5, path: $HOME");
    }

    #[test]
    fn test_unterminated_reference() {
        let err = VarExpand.render("<inline>", "${oops", &ctx(&[])).unwrap_err();
        assert!(matches!(err, OpError::Template { .. }));
    }

    #[test]
    fn test_expand_str() {
        let expanded = expand_str("<op>", "/srv/${site}/www", &ctx(&[("site", "blog")])).unwrap();
        assert_eq!(expanded, "/srv/blog/www");
    }
}
