//! Infinite-scroll view of one cache key.
//!
//! A `PagedBinding<T>` keeps every page loaded so far in a single
//! [`PagedEntry`] in the shared store. `load` serves page 1 cache first,
//! `load_more` appends the next page while the remote reports more, and
//! `refresh` starts the list over from page 1.

use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::{Cache, PageChunk, PageRequest, PagedEntry};
use crate::cancel::CancelToken;
use crate::error::LoadResult;

type PageFetcherFn<T> =
  Arc<dyn Fn(PageRequest, CancelToken) -> BoxFuture<'static, Result<PageChunk<T>>> + Send + Sync>;

pub struct PagedBinding<T> {
  cache: Cache,
  key: String,
  page_size: u32,
  ttl: Option<Duration>,
  fetcher: PageFetcherFn<T>,
}

impl<T> Clone for PagedBinding<T> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      key: self.key.clone(),
      page_size: self.page_size,
      ttl: self.ttl,
      fetcher: Arc::clone(&self.fetcher),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> PagedBinding<T> {
  /// Usually reached through [`Cache::paged`]. A page size of zero is treated as one.
  pub fn new<F, Fut>(cache: Cache, key: impl Into<String>, page_size: u32, fetcher: F) -> Self
  where
    F: Fn(PageRequest, CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PageChunk<T>>> + Send + 'static,
  {
    Self {
      cache,
      key: key.into(),
      page_size: page_size.max(1),
      ttl: None,
      fetcher: Arc::new(move |request, token| fetcher(request, token).boxed()),
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn page_size(&self) -> u32 {
    self.page_size
  }

  /// Fresh pages loaded so far.
  pub fn pages(&self) -> Option<PagedEntry<T>> {
    self.cache.store().get::<PagedEntry<T>>(&self.key, self.ttl)
  }

  /// Whether `load_more` would fetch. True before anything is loaded.
  pub fn has_more(&self) -> bool {
    self.pages().map_or(true, |pages| pages.has_more)
  }

  /// Page 1, cache first unless `force_refresh`.
  pub async fn load(&self, force_refresh: bool) -> LoadResult<PagedEntry<T>> {
    if !force_refresh {
      if let Some(hit) = self.cache.lookup::<PagedEntry<T>>(&self.key, self.ttl) {
        return Ok(Some(hit.data));
      }
    }
    self.fetch(PageRequest::first(self.page_size)).await
  }

  /// Drop the loaded pages and fetch page 1 again.
  pub async fn refresh(&self) -> LoadResult<PagedEntry<T>> {
    self.load(true).await
  }

  /// Append the next page.
  ///
  /// Without fresh pages this loads page 1. Once the remote has no more
  /// items the current list is returned without fetching.
  pub async fn load_more(&self) -> LoadResult<PagedEntry<T>> {
    let Some(current) = self.pages() else {
      return self.load(false).await;
    };

    match current.next_page() {
      Some(request) => self.fetch(request).await,
      None => {
        debug!(key = %self.key, page = current.page, "no more pages");
        Ok(Some(current))
      }
    }
  }

  /// Drop the stored pages. Running page fetches are untouched.
  pub fn invalidate(&self) -> bool {
    self.cache.invalidate(&self.key)
  }

  async fn fetch(&self, request: PageRequest) -> LoadResult<PagedEntry<T>> {
    let fetcher = Arc::clone(&self.fetcher);
    self
      .cache
      .fetch_page(&self.key, request, self.ttl, move |request, token| fetcher(request, token))
      .await
  }
}

impl<T> std::fmt::Debug for PagedBinding<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PagedBinding")
      .field("key", &self.key)
      .field("page_size", &self.page_size)
      .finish_non_exhaustive()
  }
}
