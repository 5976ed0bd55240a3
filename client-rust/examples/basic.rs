//! Basic bloom client example.
//!
//! Start a gateway first (`CATALOG_BACKEND=memory cargo run -p bloomd`), then:
//! ```bash
//! BLOOM_GATEWAY_URL=ws://localhost:3000/ws cargo run --example basic
//! ```

use std::time::Duration;

use bloom_client::{BloomClient, FlowerDraft, FlowerPatch, ServerEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let client = BloomClient::from_env();
    let mut events = client.events();

    // Print broadcasts as they arrive.
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServerEvent::Init(flowers) => println!("init: {} flowers", flowers.len()),
                ServerEvent::Created(f) => println!("created {} ({})", f.name, f.id),
                ServerEvent::Updated(f) => println!("updated {} -> {:.2}", f.name, f.price),
                ServerEvent::Deleted(id) => println!("deleted {id}"),
                ServerEvent::Notice(n) => println!("[{}] {}", n.kind, n.message),
                other => println!("{other:?}"),
            }
        }
    });

    while !client.is_connected() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let rtt = client.probe().await?;
    println!("probe round trip: {rtt:?}");

    let shops = client.list_shops().await?;
    let Some(shop) = shops.first() else {
        println!("catalog has no shops");
        return Ok(());
    };

    let created = client
        .create(FlowerDraft {
            name: "Sunflower Bunch".into(),
            price: 18.0,
            image: "/images/sunflower.jpg".into(),
            description: "Five sunflowers in kraft paper".into(),
            shop_id: shop.id.clone(),
        })
        .await?
        .into_result()?;

    let id = created
        .as_ref()
        .and_then(|f| f.get("id"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    client
        .update(
            &id,
            FlowerPatch {
                price: Some(16.5),
                ..Default::default()
            },
        )
        .await?
        .into_result()?;

    client.delete(&id).await?.into_result()?;

    let status = client.get_status().await?.into_result()?;
    println!("status: {status:?}");

    client.shutdown().await;
    Ok(())
}
