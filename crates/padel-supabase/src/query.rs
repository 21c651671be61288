use std::fmt;

use url::Url;

use crate::endpoint::ProjectEndpoint;

/// Row query against one relation, rendered as PostgREST query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    relation: String,
    columns: String,
    params: Vec<(String, String)>,
}

impl Query {
    pub fn from(relation: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            columns: "*".to_owned(),
            params: Vec::new(),
        }
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }

    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    pub fn eq(self, column: &str, value: impl fmt::Display) -> Self {
        self.filter(column, format!("eq.{value}"))
    }

    pub fn gte(self, column: &str, value: impl fmt::Display) -> Self {
        self.filter(column, format!("gte.{value}"))
    }

    pub fn lte(self, column: &str, value: impl fmt::Display) -> Self {
        self.filter(column, format!("lte.{value}"))
    }

    pub fn in_<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: fmt::Display,
    {
        let list = values
            .into_iter()
            .map(|value| quote_list_value(&value.to_string()))
            .collect::<Vec<_>>()
            .join(",");
        self.filter(column, format!("in.({list})"))
    }

    pub fn is_null(self, column: &str) -> Self {
        self.filter(column, "is.null".to_owned())
    }

    pub fn not_null(self, column: &str) -> Self {
        self.filter(column, "not.is.null".to_owned())
    }

    /// Disjunction in raw filter syntax, e.g. `challenger_team_id.eq.1,recipient_team_id.eq.1`.
    pub fn or(mut self, expression: impl Into<String>) -> Self {
        self.params
            .push(("or".to_owned(), format!("({})", expression.into())));
        self
    }

    pub fn limit(mut self, rows: u32) -> Self {
        self.params.push(("limit".to_owned(), rows.to_string()));
        self
    }

    pub fn to_url(&self, endpoint: &ProjectEndpoint) -> Url {
        let mut url = endpoint.rest(&self.relation);
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", &self.columns);
            for (key, value) in &self.params {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    fn filter(mut self, column: &str, expression: String) -> Self {
        self.params.push((column.to_owned(), expression));
        self
    }
}

fn quote_list_value(value: &str) -> String {
    if value.contains([',', '(', ')', '"', ' ']) {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_owned()
    }
}

/// Total row count from a `Content-Range` header such as `0-24/3573` or `*/0`.
pub fn parse_content_range(header: &str) -> Option<u64> {
    let (_, total) = header.trim().rsplit_once('/')?;
    if total == "*" {
        return None;
    }
    total.parse().ok()
}
