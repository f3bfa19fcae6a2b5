use super::{Filter, IndexResult, PayloadRecord, VectorIndex};

/// Lazy pagination over the payloads matching a filter.
///
/// Each call to [`Scroll::next_page`] issues one request with the continuation cursor
/// returned by the previous page. Under concurrent mutation a record may be skipped or
/// visited twice; a static collection is visited completely.
pub struct Scroll<'a, I: VectorIndex + ?Sized> {
    index: &'a I,
    filter: Filter,
    page_size: usize,
    cursor: Option<String>,
    exhausted: bool,
}

impl<'a, I: VectorIndex + ?Sized> Scroll<'a, I> {
    pub fn new(index: &'a I, filter: Filter, page_size: usize) -> Self {
        Self {
            index,
            filter,
            page_size: page_size.max(1),
            cursor: None,
            exhausted: false,
        }
    }

    /// Next page, or `None` once the sequence is exhausted.
    pub async fn next_page(&mut self) -> IndexResult<Option<Vec<PayloadRecord>>> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self
            .index
            .scroll_page(&self.filter, self.cursor.as_deref(), self.page_size)
            .await?;

        match page.next_cursor {
            Some(cursor) => self.cursor = Some(cursor),
            None => {
                self.cursor = None;
                self.exhausted = true;
            }
        }

        if page.records.is_empty() && self.exhausted {
            return Ok(None);
        }
        Ok(Some(page.records))
    }

    /// Start over from the first page.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.exhausted = false;
    }

    pub async fn collect_all(mut self) -> IndexResult<Vec<PayloadRecord>> {
        let mut records = Vec::new();
        while let Some(page) = self.next_page().await? {
            records.extend(page);
        }
        Ok(records)
    }
}
