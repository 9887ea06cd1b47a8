//! Message personalization using `{{variable}}` syntax.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use nurture_core::types::{Lead, UserProfile};

use crate::types::{PersonalizationRule, PersonalizationSource, Template};

/// Channel-ready text produced from a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: Option<String>,
    pub body: String,
}

/// Merges templates with lead, acting-user and caller-supplied data.
///
/// Rendering never fails: a variable with no value and no default becomes an
/// empty string, so delivery always proceeds.
#[derive(Debug, Clone, Default)]
pub struct TemplatePersonalizer;

impl TemplatePersonalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn render(
        &self,
        template: &Template,
        lead: &Lead,
        user: Option<&UserProfile>,
        custom_values: Option<&HashMap<String, String>>,
    ) -> RenderedMessage {
        let values: HashMap<&str, String> = template
            .personalizations
            .iter()
            .map(|rule| {
                (
                    rule.variable.as_str(),
                    self.resolve(rule, lead, user, custom_values),
                )
            })
            .collect();

        let body = substitute(&template.body, &values);
        let subject = template.subject.as_ref().map(|s| substitute(s, &values));

        RenderedMessage { subject, body }
    }

    fn resolve(
        &self,
        rule: &PersonalizationRule,
        lead: &Lead,
        user: Option<&UserProfile>,
        custom_values: Option<&HashMap<String, String>>,
    ) -> String {
        let value = match rule.source {
            PersonalizationSource::LeadData => lead_field(lead, &rule.field),
            PersonalizationSource::UserProfile => user.and_then(|u| user_field(u, &rule.field)),
            PersonalizationSource::Custom => {
                custom_values.and_then(|values| values.get(&rule.field).cloned())
            }
        };

        value
            .filter(|v| !v.is_empty())
            .or_else(|| rule.default_value.clone())
            .unwrap_or_default()
    }
}

fn lead_field(lead: &Lead, field: &str) -> Option<String> {
    match field {
        "name" => Some(lead.name.clone()),
        "email" => lead.email.clone(),
        "phone" => lead.phone.clone(),
        "source" => Some(lead.source.as_str().to_string()),
        "status" => Some(lead.status.as_str().to_string()),
        "stage" => Some(lead.stage.clone()),
        "score" => Some(lead.score.to_string()),
        other => lead.custom_fields.get(other).cloned(),
    }
}

fn user_field(user: &UserProfile, field: &str) -> Option<String> {
    match field {
        "name" => Some(user.name.clone()),
        "email" => user.email.clone(),
        "phone" => user.phone.clone(),
        _ => None,
    }
}

/// Replaces every `{{name}}` placeholder in one pass. Unknown names render empty.
fn substitute(input: &str, values: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let name = after_open[..end].trim();
        match values.get(name) {
            Some(value) => out.push_str(value),
            None => debug!(variable = name, "Unresolved template variable rendered empty"),
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}
