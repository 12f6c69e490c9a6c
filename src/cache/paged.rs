//! Page-by-page results accumulated under one key, for infinite scrolling.

/// Which page to fetch. Pages are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
  pub page: u32,
  pub page_size: u32,
}

impl PageRequest {
  pub fn first(page_size: u32) -> Self {
    Self { page: 1, page_size }
  }
}

/// One page as returned by the remote.
#[derive(Debug, Clone)]
pub struct PageChunk<T> {
  pub items: Vec<T>,
  /// Items available across all pages
  pub total: u64,
}

/// Every page loaded so far for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedEntry<T> {
  pub items: Vec<T>,
  pub total: u64,
  /// Last page loaded
  pub page: u32,
  pub page_size: u32,
  pub has_more: bool,
}

fn has_more(request: PageRequest, received: usize, total: u64) -> bool {
  received == request.page_size as usize
    && u64::from(request.page) * u64::from(request.page_size) < total
}

impl<T: Clone> PagedEntry<T> {
  /// Start a page list from `chunk`.
  pub(crate) fn first(request: PageRequest, chunk: PageChunk<T>) -> Self {
    Self {
      has_more: has_more(request, chunk.items.len(), chunk.total),
      items: chunk.items,
      total: chunk.total,
      page: request.page,
      page_size: request.page_size,
    }
  }

  /// Append `chunk` if it is the page right after the last one loaded.
  pub(crate) fn append(&self, request: PageRequest, chunk: PageChunk<T>) -> Option<Self> {
    if request.page != self.page + 1 {
      return None;
    }

    let mut items = self.items.clone();
    let received = chunk.items.len();
    items.extend(chunk.items);
    Some(Self {
      items,
      total: chunk.total,
      page: request.page,
      page_size: request.page_size,
      has_more: has_more(request, received, chunk.total),
    })
  }
}

impl<T> PagedEntry<T> {
  /// The page to load next, if the remote has more.
  pub fn next_page(&self) -> Option<PageRequest> {
    self.has_more.then(|| PageRequest {
      page: self.page + 1,
      page_size: self.page_size,
    })
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}
