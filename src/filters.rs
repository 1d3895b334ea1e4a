use crate::models::Tag;

/// Node constructors for one provider's filter language.
pub trait FilterGrammar {
    type Expr;

    fn equality(&self, key: &str, value: Option<&str>) -> Self::Expr;
    fn or(&self, children: Vec<Self::Expr>) -> Self::Expr;
    fn and(&self, children: Vec<Self::Expr>) -> Self::Expr;
}

/// Builds the tag clause of a cost query.
///
/// Several tags are combined with OR: a row matches when it carries any of
/// the requested tags.
pub fn build<G: FilterGrammar>(grammar: &G, tags: &[Tag]) -> Option<G::Expr> {
    let mut clauses: Vec<G::Expr> = tags
        .iter()
        .map(|tag| grammar.equality(&tag.key, tag.value.as_deref()))
        .collect();
    match clauses.len() {
        0 => None,
        1 => clauses.pop(),
        _ => Some(grammar.or(clauses)),
    }
}

/// ANDs the mandatory base filter with the optional tag clause.
pub fn with_base<G: FilterGrammar>(grammar: &G, base: G::Expr, tags: Option<G::Expr>) -> G::Expr {
    match tags {
        Some(tags) => grammar.and(vec![base, tags]),
        None => base,
    }
}
