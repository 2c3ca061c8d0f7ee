//! Pagination strategies.
//!
//! Two ways to walk a listing: substituting page numbers into a URL
//! template, or following each page's "next" affordance by merging its
//! parameters into the root listing URL.

use scraper::{Html, Selector};
use url::Url;

use crate::errors::FetchError;
use crate::models::{PageOrder, PaginationSpec};

/// A pagination cursor for one target.
pub enum Pager {
    Template(TemplatePager),
    NextLink(NextLinkPager),
}

impl Pager {
    pub fn new(
        spec: &PaginationSpec,
        base_url: &str,
        page_limit: u32,
        page_order: PageOrder,
        resume_page: u32,
    ) -> Result<Self, FetchError> {
        let base = Url::parse(base_url).map_err(|e| FetchError::InvalidUrl {
            url: base_url.to_string(),
            message: e.to_string(),
        })?;
        match spec {
            PaginationSpec::Template { path_template } => Ok(Pager::Template(TemplatePager::new(
                base,
                path_template.clone(),
                page_limit,
                page_order,
                resume_page,
            ))),
            PaginationSpec::NextLink {
                selector,
                block_attr,
                params_attr,
            } => Ok(Pager::NextLink(NextLinkPager {
                root: base,
                selector: selector.clone(),
                block_attr: block_attr.clone(),
                params_attr: params_attr.clone(),
                page_limit: page_limit.max(1),
                pages_served: 0,
            })),
        }
    }

    /// Produce the next page URL, or `None` when traversal is exhausted.
    /// `prev_body` is the previous listing page's body; the link-following
    /// strategy needs it, the template strategy ignores it.
    pub fn next_url(&mut self, prev_body: Option<&str>) -> Option<(u32, String)> {
        match self {
            Pager::Template(pager) => pager.next_url(),
            Pager::NextLink(pager) => pager.next_url(prev_body),
        }
    }
}

/// URL-templated pagination: page N's URL substitutes N into the path
/// template; page 1 is the bare base URL.
pub struct TemplatePager {
    base: Url,
    template: String,
    current: u32,
    remaining: u32,
    descending: bool,
}

impl TemplatePager {
    fn new(
        base: Url,
        template: String,
        page_limit: u32,
        page_order: PageOrder,
        resume_page: u32,
    ) -> Self {
        let limit = page_limit.max(1);
        let descending = page_order == PageOrder::Descending;
        // Resume from the last checkpointed page rather than restarting.
        let start = match page_order {
            PageOrder::Ascending => resume_page.clamp(1, limit),
            PageOrder::Descending => {
                if resume_page == 0 {
                    limit
                } else {
                    resume_page.min(limit)
                }
            }
        };
        let remaining = match page_order {
            PageOrder::Ascending => limit - start + 1,
            PageOrder::Descending => start,
        };
        Self {
            base,
            template,
            current: start,
            remaining,
            descending,
        }
    }

    fn next_url(&mut self) -> Option<(u32, String)> {
        if self.remaining == 0 {
            return None;
        }
        let page = self.current;
        let url = if page == 1 {
            self.base.to_string()
        } else {
            let path = self.template.replace("{page}", &page.to_string());
            self.base.join(&path).ok()?.to_string()
        };

        self.remaining -= 1;
        if self.remaining > 0 {
            self.current = if self.descending { page - 1 } else { page + 1 };
        }
        Some((page, url))
    }
}

/// Link-following pagination: each listing page carries a "next"
/// affordance whose block id and parameter string are merged into the root
/// URL's query string.
pub struct NextLinkPager {
    root: Url,
    selector: String,
    block_attr: String,
    params_attr: String,
    page_limit: u32,
    pages_served: u32,
}

impl NextLinkPager {
    fn next_url(&mut self, prev_body: Option<&str>) -> Option<(u32, String)> {
        if self.pages_served >= self.page_limit {
            return None;
        }

        let url = match prev_body {
            // First request goes to the root listing.
            None => self.root.to_string(),
            Some(body) => self.build_next(body)?,
        };

        self.pages_served += 1;
        Some((self.pages_served, url))
    }

    fn build_next(&self, body: &str) -> Option<String> {
        let selector = Selector::parse(&self.selector).ok()?;
        let document = Html::parse_document(body);
        let element = document.select(&selector).next()?;

        let block = element.value().attr(&self.block_attr)?;
        let params = element.value().attr(&self.params_attr)?;

        let mut url = self.root.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("block", block);
            for piece in params.split('&').filter(|p| !p.is_empty()) {
                match piece.split_once('=') {
                    Some((key, value)) => {
                        let key = urlencoding::decode(key).ok()?;
                        let value = urlencoding::decode(value).ok()?;
                        query.append_pair(&key, &value);
                    }
                    None => {
                        let key = urlencoding::decode(piece).ok()?;
                        query.append_pair(&key, "");
                    }
                }
            }
        }
        Some(url.to_string())
    }
}
