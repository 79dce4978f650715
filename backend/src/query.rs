//! Filtered table queries
//!
//! Builds the PostgREST query-string dialect: `col=eq.value`, `order=col.desc`,
//! `limit`, `offset`. Column names are the remote contract and are passed
//! through untouched.

use std::fmt::Display;

/// Sort direction
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

/// Query against one remote table
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    table: String,
    select: String,
    filters: Vec<(String, String)>,
    order: Vec<(String, Order)>,
    limit: Option<usize>,
    offset: Option<usize>,
    count: bool,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            select: "*".to_string(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            count: false,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Column list, e.g. `"id,name,status"`
    pub fn select(mut self, columns: &str) -> Self {
        self.select = columns.to_string();
        self
    }

    fn filter(mut self, column: &str, op: &str, value: impl Display) -> Self {
        self.filters
            .push((column.to_string(), format!("{}.{}", op, value)));
        self
    }

    pub fn eq(self, column: &str, value: impl Display) -> Self {
        self.filter(column, "eq", value)
    }

    pub fn neq(self, column: &str, value: impl Display) -> Self {
        self.filter(column, "neq", value)
    }

    pub fn gt(self, column: &str, value: impl Display) -> Self {
        self.filter(column, "gt", value)
    }

    pub fn gte(self, column: &str, value: impl Display) -> Self {
        self.filter(column, "gte", value)
    }

    pub fn lt(self, column: &str, value: impl Display) -> Self {
        self.filter(column, "lt", value)
    }

    pub fn lte(self, column: &str, value: impl Display) -> Self {
        self.filter(column, "lte", value)
    }

    /// Case-insensitive pattern match; `*` is the wildcard
    pub fn ilike(self, column: &str, pattern: &str) -> Self {
        self.filter(column, "ilike", pattern)
    }

    pub fn in_list<T: Display>(self, column: &str, values: &[T]) -> Self {
        let joined = values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.filter(column, "in", format!("({})", joined))
    }

    pub fn order(mut self, column: &str, order: Order) -> Self {
        self.order.push((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Inclusive row range, like `range(0, 9)` for the first ten rows
    pub fn range(mut self, from: usize, to: usize) -> Self {
        self.offset = Some(from);
        self.limit = Some(to.saturating_sub(from).saturating_add(1));
        self
    }

    /// Zero-based page of `page_size` rows
    pub fn page(self, page: usize, page_size: usize) -> Self {
        let size = page_size.max(1);
        let from = page.saturating_mul(size);
        self.range(from, from.saturating_add(size - 1))
    }

    /// Ask the backend for an exact row count
    pub fn with_count(mut self) -> Self {
        self.count = true;
        self
    }

    pub fn wants_count(&self) -> bool {
        self.count
    }

    /// Query parameters for a read
    pub fn read_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), self.select.clone())];
        params.extend(self.filter_params());

        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|(col, dir)| format!("{}.{}", col, dir.as_str()))
                .collect::<Vec<_>>()
                .join(",");
            params.push(("order".to_string(), order));
        }

        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }

        if let Some(offset) = self.offset {
            params.push(("offset".to_string(), offset.to_string()));
        }

        params
    }

    /// Filters only, for update and delete
    pub fn filter_params(&self) -> Vec<(String, String)> {
        self.filters.clone()
    }

    pub fn has_filters(&self) -> bool {
        !self.filters.is_empty()
    }
}

/// Parse the total out of a `Content-Range` header such as `0-9/42` or `*/0`
pub fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}
