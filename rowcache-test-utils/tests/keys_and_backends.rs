//! Key derivation properties and the LMDB backend behind a live controller.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rowcache_storage::cache::payload;
use rowcache_storage::{derive_entity_key, CacheBackend, LmdbCacheBackend, Store};
use rowcache_test_utils::assertions::{assert_not_found, assert_queries};
use rowcache_test_utils::fixtures::{brand_schema, product_schema, Shop};
use rowcache_test_utils::generators::{arb_field_value, arb_filters_pair, arb_product_row};
use rowcache_test_utils::{CacheSettings, FieldType, FieldValue, Filters};
use tempfile::TempDir;

proptest! {
    #[test]
    fn key_ignores_filter_order((forward, reverse) in arb_filters_pair()) {
        let schema = brand_schema();
        prop_assert_eq!(
            derive_entity_key(&schema, &forward),
            derive_entity_key(&schema, &reverse)
        );
    }

    #[test]
    fn int_and_text_values_share_a_key(n in any::<i64>()) {
        let schema = brand_schema();
        let as_int = Filters::new().eq("name", n);
        let as_text = Filters::new().eq("name", n.to_string());
        prop_assert_eq!(
            derive_entity_key(&schema, &as_int),
            derive_entity_key(&schema, &as_text)
        );
    }

    #[test]
    fn any_value_keys_like_its_text_form(
        value in prop_oneof![
            Just(FieldType::Bool),
            Just(FieldType::Integer),
            Just(FieldType::Float),
            Just(FieldType::Uuid),
            Just(FieldType::Timestamp),
            Just(FieldType::Json),
            Just(FieldType::File),
        ]
        .prop_flat_map(arb_field_value)
    ) {
        let schema = brand_schema();
        let typed = Filters::new().eq("name", value.clone());
        let text = Filters::new().eq("name", FieldValue::Text(value.key_text()));
        prop_assert_eq!(
            derive_entity_key(&schema, &typed),
            derive_entity_key(&schema, &text)
        );
    }

    #[test]
    fn key_is_namespaced_by_entity(n in any::<i64>()) {
        let brand_key = derive_entity_key(&brand_schema(), &Filters::pk(n));
        let product_key = derive_entity_key(&product_schema(), &Filters::pk(n));
        prop_assert!(brand_key.starts_with("shop.Brand."));
        prop_assert!(product_key.starts_with("shop.Product."));
        prop_assert_ne!(brand_key, product_key);
    }

    #[test]
    fn product_payload_survives_the_codec(row in arb_product_row()) {
        let schema = product_schema();
        let encoded = payload::encode(&schema, &row).unwrap();
        prop_assert_eq!(payload::decode(&schema, &encoded).unwrap(), row);
    }
}

fn lmdb_shop() -> (TempDir, Arc<LmdbCacheBackend>, Shop) {
    let dir = TempDir::new().unwrap();
    let settings = CacheSettings {
        lmdb_path: Some(dir.path().to_path_buf()),
        lmdb_max_size_mb: 16,
        ..CacheSettings::default()
    };
    let backend = Arc::new(LmdbCacheBackend::from_settings(&settings).unwrap().unwrap());
    let shop = Shop::with_backend(backend.clone());
    (dir, backend, shop)
}

#[test]
fn lmdb_backed_controller_serves_from_cache() {
    let (_dir, backend, shop) = lmdb_shop();
    let brand = shop.add_brand("Apple");
    let product = shop.add_product(&brand, "iPhone");
    shop.reset_query_count();

    let got = assert_queries(&shop.store, 0, || {
        shop.products
            .get(&Filters::new().eq("code", product.value("code").clone()))
            .unwrap()
    });
    assert_eq!(got, product);

    let stats = backend.stats().unwrap();
    assert!(stats.hits >= 1);
    // Brand: pk + name. Product: pk + code + (brand_id, name).
    assert_eq!(stats.entry_count, 5);
}

#[test]
fn lmdb_backed_controller_evicts_on_delete() {
    let (_dir, _backend, shop) = lmdb_shop();
    let brand = shop.add_brand("Apple");
    let product = shop.add_product(&brand, "iPhone");
    shop.product_table.delete(&product).unwrap();
    shop.reset_query_count();

    let result = assert_queries(&shop.store, 1, || {
        shop.products.get(&Filters::pk(product.value("id").clone()))
    });
    assert_not_found(&result);
}

#[test]
fn lmdb_entries_expire() {
    let (_dir, backend, _shop) = lmdb_shop();
    backend
        .set("shop.Brand.short", "{}", Some(Duration::from_millis(1)))
        .unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(backend.get("shop.Brand.short").unwrap(), None);
}

#[test]
fn lmdb_is_not_configured_without_a_path() {
    assert!(LmdbCacheBackend::from_settings(&CacheSettings::default()).is_none());
}

#[test]
fn brand_name_key_resolves_through_lmdb() {
    let (_dir, _backend, shop) = lmdb_shop();
    let brand = shop.add_brand("Samsung");
    shop.reset_query_count();
    let got = assert_queries(&shop.store, 0, || {
        shop.brands
            .get(&Filters::new().eq("name", FieldValue::from("Samsung")))
            .unwrap()
    });
    assert_eq!(got, brand);
}
