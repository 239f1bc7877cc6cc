//! Cache and engine behaviour through the public service API.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use scale_core::{AutoUpdateConfig, DeviceId, Money, Plu, Product};
use scale_db::{Database, DbConfig};
use scale_sync::mock::MockLinkFactory;
use scale_sync::{
    DeviceDescriptor, ErrorKind, LinkError, NoCredentials, ScaleService, ServiceConfig, Transport,
};

const SCALE_A: DeviceId = DeviceId(1);

fn plu(n: u32) -> Plu {
    Plu::new(n).unwrap()
}

fn product(n: u32, cents: i64) -> Product {
    Product::new(plu(n), format!("Item {}", n), Money::from_cents(cents))
}

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

async fn service_with(
    factory: Arc<MockLinkFactory>,
    db: Option<Database>,
) -> ScaleService {
    let service = ScaleService::new(ServiceConfig::default(), factory, Arc::new(NoCredentials), db);
    service
        .device_created(
            DeviceDescriptor {
                id: SCALE_A,
                name: "Scale A".into(),
                address: "192.168.1.50".into(),
                port: 1111,
                transport: Transport::Tcp,
            },
            AutoUpdateConfig::default(),
        )
        .await
        .unwrap();
    service
}

#[tokio::test]
async fn test_patch_price_accepted_by_scale() {
    let factory = Arc::new(MockLinkFactory::new());
    factory.link(SCALE_A).set_products(vec![product(100, 150)]);
    let service = service_with(factory.clone(), None).await;

    service.refresh_products(SCALE_A).await.unwrap();
    service
        .patch_product(SCALE_A, plu(100), &fields(json!({"price": "2.00"})))
        .await
        .unwrap();

    let products = service.get_products(SCALE_A).unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].plu, plu(100));
    assert_eq!(products[0].price, Money::from_cents(200));
    assert_eq!(factory.link(SCALE_A).products(), products);
}

#[tokio::test]
async fn test_refresh_leaves_no_stale_plus() {
    let factory = Arc::new(MockLinkFactory::new());
    let device = factory.link(SCALE_A);
    device.set_products(vec![product(1, 100), product(2, 200), product(3, 300)]);
    let service = service_with(factory.clone(), None).await;
    service.refresh_products(SCALE_A).await.unwrap();

    device.set_products(vec![product(2, 250), product(4, 400)]);
    let products = service.refresh_products(SCALE_A).await.unwrap();
    assert_eq!(products, device.products());
    assert_eq!(service.get_products(SCALE_A).unwrap(), device.products());
}

#[tokio::test]
async fn test_same_patch_twice() {
    let factory = Arc::new(MockLinkFactory::new());
    factory.link(SCALE_A).set_products(vec![product(100, 150), product(200, 90)]);
    let service = service_with(factory, None).await;
    service.refresh_products(SCALE_A).await.unwrap();

    let patch = fields(json!({"price": 3, "shelfLifeInDays": 4}));
    service.patch_product(SCALE_A, plu(100), &patch).await.unwrap();
    let once = service.get_products(SCALE_A).unwrap();
    service.patch_product(SCALE_A, plu(100), &patch).await.unwrap();

    assert_eq!(service.get_products(SCALE_A).unwrap(), once);
    assert_eq!(once[1], product(200, 90));
}

#[tokio::test]
async fn test_failed_push_restores_original() {
    let factory = Arc::new(MockLinkFactory::new());
    let device = factory.link(SCALE_A);
    device.set_products(vec![product(100, 150)]);
    let service = service_with(factory.clone(), None).await;
    service.refresh_products(SCALE_A).await.unwrap();

    device.fail_next(LinkError::Connection("connection reset".into()));
    let err = service
        .patch_product(SCALE_A, plu(100), &fields(json!({"price": 2})))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(service.get_products(SCALE_A).unwrap(), vec![product(100, 150)]);
    assert_eq!(device.products(), vec![product(100, 150)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refresh_and_patch_never_interleave() {
    let factory = Arc::new(MockLinkFactory::new());
    let device = factory.link(SCALE_A);
    device.set_products(vec![product(100, 150), product(200, 300)]);
    device.set_latency(Duration::from_millis(30));
    let service = Arc::new(service_with(factory.clone(), None).await);
    service.refresh_products(SCALE_A).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..6 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                service.refresh_products(SCALE_A).await.map(|_| ())
            } else {
                let price = json!({ "price": 2 + i });
                service
                    .patch_product(SCALE_A, plu(100), &fields(price))
                    .await
                    .map(|_| ())
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(device.max_in_flight(), 1);
    assert_eq!(service.get_products(SCALE_A).unwrap(), device.products());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_see_whole_tables() {
    let factory = Arc::new(MockLinkFactory::new());
    let device = factory.link(SCALE_A);
    let small: Vec<Product> = (1..=3).map(|n| product(n, 100)).collect();
    let large: Vec<Product> = (10..=60).map(|n| product(n, 200)).collect();
    let service = Arc::new(service_with(factory.clone(), None).await);

    let reader = {
        let service = service.clone();
        let (small, large) = (small.clone(), large.clone());
        tokio::spawn(async move {
            for _ in 0..500 {
                let seen = service.get_products(SCALE_A).unwrap();
                assert!(seen.is_empty() || seen == small || seen == large);
                tokio::task::yield_now().await;
            }
        })
    };

    for round in 0..20 {
        device.set_products(if round % 2 == 0 { large.clone() } else { small.clone() });
        service.refresh_products(SCALE_A).await.unwrap();
    }
    reader.await.unwrap();
}

#[tokio::test]
async fn test_staged_edits_survive_restart() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let factory = Arc::new(MockLinkFactory::new());
    factory.link(SCALE_A).set_products(vec![product(1, 100), product(2, 200)]);

    let first = service_with(factory.clone(), Some(db.clone())).await;
    first.refresh_products(SCALE_A).await.unwrap();
    first
        .stage_product(SCALE_A, plu(2), &fields(json!({"name": "Rye bread"})))
        .await
        .unwrap();
    first.registry().shutdown().await;

    let second = service_with(factory.clone(), Some(db)).await;
    second.restore().await.unwrap();
    assert_eq!(second.get_products(SCALE_A).unwrap()[1].name, "Rye bread");

    let report = second.upload_staged(SCALE_A).await.unwrap();
    assert_eq!(report.pushed, vec![plu(2)]);
    assert_eq!(factory.link(SCALE_A).products()[1].name, "Rye bread");
    assert!(second.engine().store().load(SCALE_A).dirty().is_empty());
}

#[tokio::test]
async fn test_diagnose_reports_refused_products() {
    let factory = Arc::new(MockLinkFactory::new());
    let device = factory.link(SCALE_A);
    device.set_products((1..=80).map(|n| product(n, 100)).collect());
    let service = service_with(factory.clone(), None).await;
    service.refresh_products(SCALE_A).await.unwrap();

    device.refuse_batches_where(|batch| {
        batch.iter().any(|p| p.plu.get() == 17 || p.plu.get() == 66)
    });
    let diagnosis = service.diagnose_upload(SCALE_A).await.unwrap();

    let bad: Vec<u32> = diagnosis.bad_products.iter().map(|p| p.plu.get()).collect();
    assert_eq!(bad, vec![17, 66]);
    assert_eq!(diagnosis.total_count, 80);
    assert_eq!(service.get_products(SCALE_A).unwrap().len(), 80);
}
