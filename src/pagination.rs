use crate::error::AppError;
use std::future::Future;
use tracing::debug;

pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

/// Requests pages until the provider stops returning a continuation token.
///
/// Items are appended in arrival order. An empty token ends the loop like a
/// missing one.
pub async fn drain_pages<T, F, Fut>(label: &str, mut fetch_page: F) -> Result<Vec<T>, AppError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, AppError>>,
{
    let mut out = Vec::new();
    let mut token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = fetch_page(token.take()).await?;
        pages += 1;
        debug!(label, page = pages, items = page.items.len(), "fetched page");
        out.extend(page.items);

        match page.next.filter(|t| !t.is_empty()) {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    Ok(out)
}
