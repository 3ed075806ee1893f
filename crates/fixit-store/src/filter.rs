//! Filter predicates and query parameters for row-store requests.

use std::fmt::Display;

/// Sort direction for an `order` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn as_str(&self) -> &'static str {
        match self {
            Order::Asc => "asc",
            Order::Desc => "desc",
        }
    }
}

/// Ordered builder for row-store query parameters.
///
/// Parameters render in insertion order, so two calls building the same
/// logical query produce identical request URLs. Values are left
/// unencoded here; the HTTP layer percent-encodes them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    params: Vec<(String, String)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Column projection, including nested relationship expansion such as
    /// `*,category:categories(*)`.
    pub fn select(mut self, projection: &str) -> Self {
        self.params.push(("select".to_string(), projection.to_string()));
        self
    }

    /// Equality on a column.
    pub fn eq(mut self, column: &str, value: impl Display) -> Self {
        self.params.push((column.to_string(), format!("eq.{value}")));
        self
    }

    /// Negated equality on a column.
    pub fn neq(mut self, column: &str, value: impl Display) -> Self {
        self.params.push((column.to_string(), format!("neq.{value}")));
        self
    }

    /// Case-insensitive pattern match; `*` is the wildcard.
    pub fn ilike(mut self, column: &str, pattern: impl Display) -> Self {
        self.params.push((column.to_string(), format!("ilike.{pattern}")));
        self
    }

    /// Set membership.
    pub fn is_in<I>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Display,
    {
        let list = values
            .into_iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.params.push((column.to_string(), format!("in.({list})")));
        self
    }

    /// Disjunction of pre-rendered conditions, e.g.
    /// `client_id.eq.<id>,provider_id.eq.<id>`.
    pub fn or(mut self, conditions: impl Display) -> Self {
        self.params.push(("or".to_string(), format!("({conditions})")));
        self
    }

    /// Sort on a column.
    pub fn order(mut self, column: &str, order: Order) -> Self {
        self.params
            .push(("order".to_string(), format!("{column}.{}", order.as_str())));
        self
    }

    /// Cap the number of returned rows.
    pub fn limit(mut self, count: usize) -> Self {
        self.params.push(("limit".to_string(), count.to_string()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }
}
