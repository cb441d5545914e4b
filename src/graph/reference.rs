//! `${provider.type.name.attr}` references between resources.
//!
//! A string attribute that is exactly one reference resolves to the referenced
//! value with its JSON type intact. References embedded in a longer string
//! are interpolated as text. `attr` may be a dotted path into a nested map;
//! the attribute `id` names the provider-assigned id. `$${` is a literal
//! `${` and never starts a reference.

use crate::config::{Attributes, ResourceId};
use crate::error::{CirrusError, Result, ValidationError};
use serde_json::Value;

/// Attribute name that resolves to the provider-assigned id.
pub const ID_ATTRIBUTE: &str = "id";

/// A parsed reference to another resource's attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// The referenced resource.
    pub target: ResourceId,
    /// Attribute path on the target (`id` for the provider id).
    pub attribute: String,
    /// Original expression, without the `${` `}` delimiters.
    pub expression: String,
}

/// Outcome of resolving a value that may contain references.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Fully resolved.
    Known(Value),
    /// Depends on a resource that does not exist yet.
    Unknown,
}

impl Resolution {
    /// Returns the value if known.
    #[must_use]
    pub const fn known(&self) -> Option<&Value> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown => None,
        }
    }
}

enum Segment<'a> {
    Literal(&'a str),
    Expr(&'a str),
}

/// Escaped form of `${`.
const ESCAPED_OPEN: &str = "$${";

fn segments<'a>(input: &'a str, owner: &ResourceId) -> Result<Vec<Segment<'a>>> {
    let mut out = Vec::new();
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        let (literal, tail) = rest.split_at(pos);
        if !literal.is_empty() {
            out.push(Segment::Literal(literal));
        }

        if tail.starts_with(ESCAPED_OPEN) {
            out.push(Segment::Literal(&tail[1..3]));
            rest = &tail[3..];
        } else if let Some(after) = tail.strip_prefix("${") {
            let Some(end) = after.find('}') else {
                return Err(malformed(owner, tail));
            };
            out.push(Segment::Expr(&after[..end]));
            rest = &after[end + 1..];
        } else {
            out.push(Segment::Literal(&tail[..1]));
            rest = &tail[1..];
        }
    }

    if !rest.is_empty() {
        out.push(Segment::Literal(rest));
    }
    Ok(out)
}

/// Escapes `text` so that it resolves to itself, with no references.
#[must_use]
pub fn escape_literal(text: &str) -> String {
    text.replace("${", ESCAPED_OPEN)
}

fn malformed(owner: &ResourceId, expression: &str) -> CirrusError {
    CirrusError::Validation(ValidationError::MalformedReference {
        resource: owner.to_string(),
        expression: expression.to_string(),
    })
}

/// Secret placeholders are resolved at load time and are not graph edges.
fn is_secret(expr: &str) -> bool {
    expr.trim_start().starts_with("secret:")
}

fn parse_expression(expr: &str, owner: &ResourceId) -> Result<Reference> {
    let trimmed = expr.trim();
    let parts: Vec<&str> = trimmed.splitn(4, '.').collect();
    if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
        return Err(malformed(owner, &format!("${{{expr}}}")));
    }

    Ok(Reference {
        target: ResourceId::new(parts[0], parts[1], parts[2]),
        attribute: parts[3].to_string(),
        expression: trimmed.to_string(),
    })
}

/// Extracts every reference found in the attribute map, recursing into
/// nested lists and maps. Duplicates are kept in encounter order.
///
/// # Errors
///
/// Returns a validation error naming `owner` for malformed expressions.
pub fn extract_references(owner: &ResourceId, attributes: &Attributes) -> Result<Vec<Reference>> {
    let mut refs = Vec::new();
    for value in attributes.values() {
        collect(owner, value, &mut refs)?;
    }
    Ok(refs)
}

/// References found in a single attribute value.
///
/// # Errors
///
/// Returns a validation error naming `owner` for malformed expressions.
pub fn references_in(owner: &ResourceId, value: &Value) -> Result<Vec<Reference>> {
    let mut refs = Vec::new();
    collect(owner, value, &mut refs)?;
    Ok(refs)
}

fn collect(owner: &ResourceId, value: &Value, refs: &mut Vec<Reference>) -> Result<()> {
    match value {
        Value::String(s) => {
            for segment in segments(s, owner)? {
                if let Segment::Expr(expr) = segment
                    && !is_secret(expr)
                {
                    refs.push(parse_expression(expr, owner)?);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(owner, item, refs)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect(owner, item, refs)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Resolves every reference in `value` through `lookup`.
///
/// The result is [`Resolution::Unknown`] as soon as any reference inside the
/// value is unknown.
///
/// # Errors
///
/// Propagates lookup errors and malformed expressions.
pub fn resolve_value<F>(owner: &ResourceId, value: &Value, lookup: &F) -> Result<Resolution>
where
    F: Fn(&Reference) -> Result<Resolution>,
{
    match value {
        Value::String(s) => resolve_string(owner, s, lookup),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match resolve_value(owner, item, lookup)? {
                    Resolution::Known(v) => out.push(v),
                    Resolution::Unknown => return Ok(Resolution::Unknown),
                }
            }
            Ok(Resolution::Known(Value::Array(out)))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                match resolve_value(owner, item, lookup)? {
                    Resolution::Known(v) => {
                        out.insert(key.clone(), v);
                    }
                    Resolution::Unknown => return Ok(Resolution::Unknown),
                }
            }
            Ok(Resolution::Known(Value::Object(out)))
        }
        other => Ok(Resolution::Known(other.clone())),
    }
}

fn resolve_string<F>(owner: &ResourceId, s: &str, lookup: &F) -> Result<Resolution>
where
    F: Fn(&Reference) -> Result<Resolution>,
{
    let parts = segments(s, owner)?;

    if let [Segment::Expr(expr)] = parts.as_slice()
        && !is_secret(expr)
    {
        return lookup(&parse_expression(expr, owner)?);
    }

    let mut out = String::with_capacity(s.len());
    for part in parts {
        match part {
            Segment::Literal(text) => out.push_str(text),
            Segment::Expr(expr) if is_secret(expr) => {
                out.push_str("${");
                out.push_str(expr);
                out.push('}');
            }
            Segment::Expr(expr) => match lookup(&parse_expression(expr, owner)?)? {
                Resolution::Known(Value::String(v)) => out.push_str(&v),
                Resolution::Known(v) => out.push_str(&v.to_string()),
                Resolution::Unknown => return Ok(Resolution::Unknown),
            },
        }
    }
    Ok(Resolution::Known(Value::String(out)))
}

/// Resolves a whole attribute map. Keys whose value is unknown are returned
/// separately.
///
/// # Errors
///
/// Propagates lookup errors and malformed expressions.
pub fn resolve_attributes<F>(
    owner: &ResourceId,
    attributes: &Attributes,
    lookup: &F,
) -> Result<(Attributes, Vec<String>)>
where
    F: Fn(&Reference) -> Result<Resolution>,
{
    let mut resolved = Attributes::new();
    let mut unknown = Vec::new();
    for (key, value) in attributes {
        match resolve_value(owner, value, lookup)? {
            Resolution::Known(v) => {
                resolved.insert(key.clone(), v);
            }
            Resolution::Unknown => unknown.push(key.clone()),
        }
    }
    Ok((resolved, unknown))
}

/// Looks up a dotted attribute path in an attribute map.
#[must_use]
pub fn lookup_path<'a>(attributes: &'a Attributes, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = attributes.get(first)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner() -> ResourceId {
        ResourceId::new("aws", "s3_bucket", "assets")
    }

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => Attributes::new(),
        }
    }

    #[test]
    fn test_extract_nested_references() {
        let attributes = attrs(json!({
            "owner": "${aws.instance.web.id}",
            "tags": { "zone": "zone-${google.compute_instance.db.zone}" },
            "list": ["${azurerm.virtual_machine.vm.id}", "plain"],
            "password": "${secret:PW}",
        }));

        let refs = extract_references(&owner(), &attributes).expect("should extract");
        let targets: Vec<String> = refs.iter().map(|r| r.target.to_string()).collect();

        assert_eq!(refs.len(), 3);
        assert!(targets.contains(&String::from("aws.instance.web")));
        assert!(targets.contains(&String::from("google.compute_instance.db")));
        assert!(targets.contains(&String::from("azurerm.virtual_machine.vm")));
    }

    #[test]
    fn test_malformed_reference() {
        let attributes = attrs(json!({ "owner": "${aws.instance}" }));
        let err = extract_references(&owner(), &attributes).expect_err("malformed");
        assert!(matches!(
            err,
            CirrusError::Validation(ValidationError::MalformedReference { .. })
        ));

        let unterminated = attrs(json!({ "owner": "${aws.instance.web.id" }));
        assert!(extract_references(&owner(), &unterminated).is_err());
    }

    #[test]
    fn test_whole_reference_keeps_type() {
        let lookup = |_: &Reference| Ok(Resolution::Known(json!(8080)));
        let resolved = resolve_value(&owner(), &json!("${aws.instance.web.port}"), &lookup)
            .expect("should resolve");
        assert_eq!(resolved, Resolution::Known(json!(8080)));
    }

    #[test]
    fn test_embedded_reference_is_text() {
        let lookup = |r: &Reference| {
            assert_eq!(r.attribute, "id");
            Ok(Resolution::Known(json!("i-abc")))
        };
        let resolved = resolve_value(&owner(), &json!("owner-${aws.instance.web.id}"), &lookup)
            .expect("should resolve");
        assert_eq!(resolved, Resolution::Known(json!("owner-i-abc")));
    }

    #[test]
    fn test_unknown_propagates() {
        let lookup = |_: &Reference| Ok(Resolution::Unknown);
        let attributes = attrs(json!({ "owner": { "id": "${aws.instance.web.id}" }, "size": 3 }));
        let (resolved, unknown) =
            resolve_attributes(&owner(), &attributes, &lookup).expect("should resolve");

        assert_eq!(unknown, vec![String::from("owner")]);
        assert_eq!(resolved.get("size"), Some(&json!(3)));
    }

    #[test]
    fn test_escaped_open_is_literal() {
        let attributes = attrs(json!({ "password": "Xy$${9}z", "cost": "$5 ${aws.instance.web.id}" }));
        let refs = extract_references(&owner(), &attributes).expect("should extract");
        assert_eq!(refs.len(), 1);

        let lookup = |_: &Reference| Ok(Resolution::Known(json!("i-1")));
        let (resolved, _) =
            resolve_attributes(&owner(), &attributes, &lookup).expect("should resolve");
        assert_eq!(resolved["password"], json!("Xy${9}z"));
        assert_eq!(resolved["cost"], json!("$5 i-1"));

        let escaped = escape_literal("a$${b}${c}");
        let (resolved, _) = resolve_attributes(&owner(), &attrs(json!({ "v": escaped })), &lookup)
            .expect("should resolve");
        assert_eq!(resolved["v"], json!("a$${b}${c}"));
    }

    #[test]
    fn test_lookup_path() {
        let attributes = attrs(json!({ "tags": { "role": "web" }, "ips": ["10.0.0.1"] }));
        assert_eq!(lookup_path(&attributes, "tags.role"), Some(&json!("web")));
        assert_eq!(lookup_path(&attributes, "ips.0"), Some(&json!("10.0.0.1")));
        assert_eq!(lookup_path(&attributes, "tags.missing"), None);
    }
}
