// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cached product catalog listings.

use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};

use futures::future::try_join_all;
use pantry_store::Store;
use serde::{Deserialize, Serialize};

use crate::{AutocompleteIndex, BoxError, Codec, EntryOptions, ObjectCache, Result};

/// Tag carried by every catalog listing.
pub const CATALOG_TAG: &str = "catalog";

const CATEGORIES_KEY: &str = "categories";
const ALL_PRODUCTS_KEY: &str = "products:all";
const PRODUCT_NAMES_KEY: &str = "products:names";
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// A product as listed by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Catalog identifier.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Price in the shop's currency, as the decimal text the catalog reports.
    pub price: String,
    /// Identifiers of the categories the product is listed in.
    pub categories: Vec<u64>,
    /// Whether the product can be ordered.
    pub in_stock: bool,
    /// URL of the main product image.
    pub image: Option<String>,
}

/// A product category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Catalog identifier.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Parent category, if this is a subcategory.
    pub parent: Option<u64>,
}

/// The products of one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryProducts {
    /// The category.
    pub category: Category,
    /// Its products, in catalog order.
    pub items: Vec<Product>,
}

/// The upstream source of catalog data, typically an e-commerce API client.
pub trait Catalog: Send + Sync {
    /// Error returned by the upstream.
    type Error: Into<BoxError> + Send;

    /// Lists every category.
    fn categories(&self) -> impl Future<Output = std::result::Result<Vec<Category>, Self::Error>> + Send;

    /// Lists the products of one category.
    fn products_in_category(
        &self,
        category_id: u64,
    ) -> impl Future<Output = std::result::Result<Vec<Product>, Self::Error>> + Send;

    /// Searches products by free text.
    fn search(&self, query: &str) -> impl Future<Output = std::result::Result<Vec<Product>, Self::Error>> + Send;
}

/// Returns the key of the cart of an authenticated user.
///
/// # Examples
///
/// ```
/// assert_eq!(pantry::cart_key(42), "cart:42");
/// ```
#[must_use]
pub fn cart_key(user_id: impl fmt::Display) -> String {
    format!("cart:{user_id}")
}

/// Read-through cache of [`Catalog`] listings.
///
/// Listings are stored compressed and tagged [`CATALOG_TAG`], so
/// [`refresh_listings`](Self::refresh_listings) can drop and repopulate all of them at once.
/// Search results are additionally tagged `search:query:<query>` for targeted invalidation.
pub struct CatalogCache<C, S: Store> {
    catalog: C,
    cache: Arc<ObjectCache<S>>,
    ttl: Duration,
}

impl<C, S: Store> fmt::Debug for CatalogCache<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogCache")
            .field("cache", &self.cache)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<C: Catalog, S: Store> CatalogCache<C, S> {
    /// Creates a catalog cache with hour-long listings.
    #[must_use]
    pub fn new(catalog: C, cache: Arc<ObjectCache<S>>) -> Self {
        Self {
            catalog,
            cache,
            ttl: DEFAULT_TTL,
        }
    }

    /// Sets the lifetime of cached listings.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns the upstream catalog.
    #[must_use]
    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    fn listing_options(&self) -> EntryOptions {
        EntryOptions::new(self.ttl).compressed().with_tag(CATALOG_TAG)
    }

    /// Returns every category.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Upstream`](crate::Error::Upstream) if the catalog fails, or a store
    /// error if the listing cannot be cached.
    pub async fn categories(&self) -> Result<Vec<Category>> {
        self.cache
            .try_get_or_set(CATEGORIES_KEY, || self.catalog.categories(), &self.listing_options())
            .await
    }

    /// Returns the products of a category, cached at `products:by_category:<id>`.
    ///
    /// # Errors
    ///
    /// Same as [`categories`](Self::categories).
    pub async fn products_by_category(&self, category_id: u64) -> Result<Vec<Product>> {
        self.cache
            .try_get_or_set(
                &format!("products:by_category:{category_id}"),
                || self.catalog.products_in_category(category_id),
                &self.listing_options(),
            )
            .await
    }

    /// Returns the products of every category, grouped by category.
    ///
    /// # Errors
    ///
    /// Same as [`categories`](Self::categories).
    pub async fn all_products(&self) -> Result<Vec<CategoryProducts>> {
        if let Some(cached) = self.cache.get(ALL_PRODUCTS_KEY, Codec::Compressed).await {
            return Ok(cached);
        }

        let categories = self.categories().await?;
        let listings = try_join_all(categories.into_iter().map(|category| async move {
            let items = self.products_by_category(category.id).await?;
            Ok::<_, crate::Error>(CategoryProducts { category, items })
        }))
        .await?;

        self.cache.set(ALL_PRODUCTS_KEY, &listings, &self.listing_options()).await?;
        Ok(listings)
    }

    /// Returns the distinct names of all products, in listing order.
    ///
    /// # Errors
    ///
    /// Same as [`categories`](Self::categories).
    pub async fn product_names(&self) -> Result<Vec<String>> {
        if let Some(cached) = self.cache.get(PRODUCT_NAMES_KEY, Codec::Compressed).await {
            return Ok(cached);
        }

        let listings = self.all_products().await?;
        let mut seen = BTreeSet::new();
        let names: Vec<String> = listings
            .iter()
            .flat_map(|listing| &listing.items)
            .filter(|product| seen.insert(product.name.as_str()))
            .map(|product| product.name.clone())
            .collect();

        self.cache.set(PRODUCT_NAMES_KEY, &names, &self.listing_options()).await?;
        Ok(names)
    }

    /// Returns the products matching `query`, cached at `search:products:<query>`.
    ///
    /// The query is trimmed and lowercased first; a blank query matches nothing.
    ///
    /// # Errors
    ///
    /// Same as [`categories`](Self::categories).
    pub async fn search(&self, query: &str) -> Result<Vec<Product>> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let options = self.listing_options().with_tag(format!("search:query:{query}"));
        self.cache
            .try_get_or_set(&format!("search:products:{query}"), || self.catalog.search(&query), &options)
            .await
    }

    /// Drops every cached listing and fetches them again, returning the number of products.
    ///
    /// # Errors
    ///
    /// Same as [`categories`](Self::categories).
    pub async fn refresh_listings(&self) -> Result<usize> {
        let dropped = self.cache.invalidate_by_tag(CATALOG_TAG).await?;
        let listings = self.all_products().await?;
        self.product_names().await?;

        let products = listings.iter().map(|listing| listing.items.len()).sum();
        tracing::info!(
            catalog.dropped = dropped,
            catalog.categories = listings.len(),
            catalog.products = products,
            "catalog.refreshed"
        );
        Ok(products)
    }

    /// Rebuilds `index` from the current product names and returns its entry count.
    ///
    /// # Errors
    ///
    /// Returns an error if the names cannot be listed, or
    /// [`Error::IndexBuildFailure`](crate::Error::IndexBuildFailure) if the build fails.
    pub async fn rebuild_autocomplete(&self, index: &AutocompleteIndex<S>) -> Result<u64> {
        let names = self.product_names().await?;
        index.build(&names).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cart_keys() {
        assert_eq!(cart_key(7), "cart:7");
        assert_eq!(cart_key("a1b2"), "cart:a1b2");
    }

    #[test]
    fn listings_survive_the_compressed_codec() {
        let listing = vec![CategoryProducts {
            category: Category {
                id: 3,
                name: "Pizza".to_owned(),
                parent: None,
            },
            items: vec![Product {
                id: 11,
                name: "Pizza Diavola".to_owned(),
                price: "12.50".to_owned(),
                categories: vec![3],
                in_stock: true,
                image: None,
            }],
        }];

        let bytes = Codec::Compressed.encode(&listing).unwrap();
        let decoded: Vec<CategoryProducts> = Codec::Compressed.decode(&bytes).unwrap();
        assert_eq!(decoded, listing);
    }
}
