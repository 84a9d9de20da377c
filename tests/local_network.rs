use futures_util::StreamExt;
use linklocal::ResolverOptions;
use linklocal::ResponderOptions;
use linklocal::ServiceEntry;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn first_matching(
    stream: impl futures_util::Stream<Item = Result<ServiceEntry, linklocal::ResolveError>> + Send,
    instance: &str,
) -> Option<ServiceEntry> {
    let instance = instance.to_string();
    Box::pin(
        stream
            .filter_map(|result| async { result.ok() })
            .filter(move |entry| futures_util::future::ready(entry.instance == instance)),
    )
    .next()
    .await
}

#[tokio::test]
#[ignore = "needs a multicast-capable network"]
async fn register_then_browse_round_trip() -> anyhow::Result<()> {
    init();

    let responder = linklocal::register(
        "Printer",
        "_ipp._tcp",
        "local",
        631,
        vec!["rp=ipp/print".to_string()],
        vec![],
        ResponderOptions::default(),
    )
    .await?;

    let cancel = CancellationToken::new();
    let entries = linklocal::browse("_ipp._tcp", "local", ResolverOptions::default(), cancel.clone());

    // When
    let entry = tokio::time::timeout(Duration::from_secs(10), first_matching(entries, "Printer"))
        .await?
        .expect("the published instance must be discovered");

    // Then
    assert_eq!(entry.service, "_ipp._tcp");
    assert_eq!(entry.domain, "local");
    assert_eq!(entry.port, 631);
    assert_eq!(entry.text, vec!["rp=ipp/print".to_string()]);
    assert!(!entry.hostname.is_empty());
    assert!(!entry.addr_v4.is_empty() || !entry.addr_v6.is_empty());

    cancel.cancel();
    responder.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore = "needs a multicast-capable network"]
async fn lookup_resolves_the_named_instance() -> anyhow::Result<()> {
    init();

    let responder = linklocal::register(
        "Scanner",
        "_scanner._tcp",
        "local",
        1234,
        vec![],
        vec![],
        ResponderOptions::default(),
    )
    .await?;

    let cancel = CancellationToken::new();
    let entries = linklocal::lookup(
        "Scanner",
        "_scanner._tcp",
        "local",
        ResolverOptions::default(),
        cancel.clone(),
    );

    // When
    let entry = tokio::time::timeout(Duration::from_secs(10), first_matching(entries, "Scanner"))
        .await?
        .expect("the published instance must be resolved");

    // Then
    assert_eq!(entry.port, 1234);
    assert_eq!(entry.text, vec![String::new()], "an empty TXT set is one empty string");

    cancel.cancel();
    responder.shutdown().await;
    Ok(())
}
