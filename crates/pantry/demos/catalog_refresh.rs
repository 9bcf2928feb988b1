// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Catalog refresh: two workers share one store, only one refreshes per round.
//! The refreshed names feed the autocomplete index that the request path queries.

use std::{sync::Arc, time::Duration};

use pantry::{Catalog, Category, InvalidationMessage, Pantry, PantryConfig, Product};
use pantry_store::memory::MemoryStore;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
#[error("shop api unavailable")]
struct ShopError;

#[derive(Debug, Clone, Copy)]
struct Shop;

fn product(id: u64, name: &str, price: &str) -> Product {
    Product {
        id,
        name: name.to_owned(),
        price: price.to_owned(),
        categories: vec![1],
        in_stock: true,
        image: None,
    }
}

impl Catalog for Shop {
    type Error = ShopError;

    async fn categories(&self) -> Result<Vec<Category>, ShopError> {
        Ok(vec![Category {
            id: 1,
            name: "Pizza".to_owned(),
            parent: None,
        }])
    }

    async fn products_in_category(&self, _category_id: u64) -> Result<Vec<Product>, ShopError> {
        // Simulate a slow upstream.
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(vec![
            product(1, "Pizza Margherita", "8.50"),
            product(2, "Pizza Diavola", "9.90"),
            product(3, "Pizza Quattro Formaggi", "10.90"),
        ])
    }

    async fn search(&self, query: &str) -> Result<Vec<Product>, ShopError> {
        let products = self.products_in_category(1).await?;
        Ok(products.into_iter().filter(|p| p.name.to_lowercase().contains(query)).collect())
    }
}

#[tokio::main]
async fn main() -> Result<(), pantry::Error> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let store = Arc::new(MemoryStore::new());
    let config = PantryConfig::default();
    let (stop, shutdown) = watch::channel(false);

    // Two "processes" sharing one store.
    let mut workers = Vec::new();
    for _ in 0..2 {
        let pantry = Pantry::from_shared(Arc::clone(&store), config.clone());
        let shutdown = shutdown.clone();

        workers.push(tokio::spawn(async move {
            let catalog = pantry.catalog(Shop);
            let index = pantry.autocomplete("autocomplete:products");
            let job = pantry
                .periodic("refresh_catalog")
                .with_interval(Duration::from_secs(2))
                .with_skip_interval(Duration::from_secs(1));
            let (catalog, index) = (&catalog, &index);

            job.run(
                move || async move {
                    catalog.refresh_listings().await?;
                    catalog.rebuild_autocomplete(&index).await.map(drop)
                },
                shutdown,
            )
            .await;
        }));
    }

    let pantry = Pantry::from_shared(store, config);
    pantry.listen(None).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let index = pantry.autocomplete("autocomplete:products");
    for query in ["pi", "pizza ", "pizza q"] {
        let completion = index.search(query).await?;
        println!("{query:?} -> {:?} {:?}", completion.mode, completion.suggestions);
    }

    // A price change elsewhere drops the cached listing for everyone.
    pantry
        .invalidate(&InvalidationMessage::Key("products:by_category:1".to_owned()))
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("listing cached: {}", pantry.cache().exists("products:by_category:1").await?);

    stop.send_replace(true);
    for worker in workers {
        if let Err(e) = worker.await {
            eprintln!("worker failed: {e}");
        }
    }
    pantry.close().await;
    Ok(())
}
