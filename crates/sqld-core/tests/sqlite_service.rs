use anyhow::Result;
use serde_json::{json, Map, Value};

use sqld_core::{
    decompose, response, Database, DbKind, Dialect, ExecResult, Payload, QueryService,
    ResponseFormat, SqlValue,
};

const PREFIX: &str = "/";

async fn service() -> Result<QueryService> {
    let db = Database::connect(DbKind::Sqlite, "sqlite::memory:", 4).await?;
    let service = QueryService::new(db, Dialect::new(DbKind::Sqlite, None));
    service
        .raw("CREATE TABLE products (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, price REAL, note TEXT)")
        .await?;
    service.take_writes();
    Ok(service)
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn rows(payload: Payload) -> Vec<sqld_core::Row> {
    match payload {
        Payload::Rows(rows) => rows,
        other => panic!("expected rows, got {other:?}"),
    }
}

#[tokio::test]
async fn create_read_update_delete() -> Result<()> {
    let service = service().await?;

    let created = service
        .create("products", &object(json!({"name": "Widget", "price": 19.99})))
        .await?;
    let Payload::Created(row) = created else {
        panic!("expected created row, got {created:?}");
    };
    assert_eq!(row.get("id"), Some(&SqlValue::Int(1)));
    assert_eq!(row.get("name"), Some(&SqlValue::Text("Widget".into())));

    let request = decompose(PREFIX, "/products/1", None)?;
    let found = rows(service.read(&request).await?);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("price"), Some(&SqlValue::Float(19.99)));
    assert_eq!(found[0].get("note"), Some(&SqlValue::Null));

    let request = decompose(PREFIX, "/products/1", None)?;
    let updated = service
        .update(&request, &object(json!({"price": 17.5, "note": null})))
        .await?;
    assert_eq!(updated, Payload::Exec(ExecResult { rows_affected: 1 }));

    let request = decompose(PREFIX, "/products", Some("name=Widget"))?;
    let found = rows(service.read(&request).await?);
    assert_eq!(found[0].get("price"), Some(&SqlValue::Float(17.5)));

    let deleted = service.delete(&decompose(PREFIX, "/products/1", None)?).await?;
    assert_eq!(deleted, Payload::Exec(ExecResult { rows_affected: 1 }));

    let missing = service.delete(&decompose(PREFIX, "/products/999", None)?).await?;
    assert_eq!(missing, Payload::Exec(ExecResult { rows_affected: 0 }));

    assert_eq!(service.take_writes(), 4);
    assert_eq!(service.pending_writes(), 0);
    Ok(())
}

#[tokio::test]
async fn path_id_matches_query_id() -> Result<()> {
    let service = service().await?;
    for name in ["a", "b", "c"] {
        service
            .create("products", &object(json!({ "name": name })))
            .await?;
    }

    let by_path = service.read(&decompose(PREFIX, "/products/2", None)?).await?;
    let by_query = service
        .read(&decompose(PREFIX, "/products", Some("id=2"))?)
        .await?;
    assert_eq!(by_path, by_query);
    assert_eq!(rows(by_path).len(), 1);
    Ok(())
}

#[tokio::test]
async fn limit_offset_and_order() -> Result<()> {
    let service = service().await?;
    for (name, price) in [("a", 3.0), ("b", 1.0), ("c", 2.0), ("d", 4.0)] {
        service
            .create("products", &object(json!({ "name": name, "price": price })))
            .await?;
    }

    let request = decompose(
        PREFIX,
        "/products",
        Some("__order_by__=price%20DESC&__limit__=2&__offset__=1"),
    )?;
    let found = rows(service.read(&request).await?);
    let names: Vec<String> = found
        .iter()
        .map(|row| row.get("name").map(ToString::to_string).unwrap_or_default())
        .collect();
    assert_eq!(names, vec!["a", "c"]);

    let request = decompose(PREFIX, "/products", Some("__limit__=abc"))?;
    assert_eq!(rows(service.read(&request).await?).len(), 4);

    let request = decompose(PREFIX, "/products", Some("__offset__=3"))?;
    assert_eq!(rows(service.read(&request).await?).len(), 1);
    Ok(())
}

#[tokio::test]
async fn repeated_filters_match_any_value() -> Result<()> {
    let service = service().await?;
    for name in ["a", "b", "c"] {
        service
            .create("products", &object(json!({ "name": name })))
            .await?;
    }
    let request = decompose(PREFIX, "/products", Some("name=a&name=c"))?;
    assert_eq!(rows(service.read(&request).await?).len(), 2);
    Ok(())
}

#[tokio::test]
async fn created_rows_are_found_by_their_values() -> Result<()> {
    let service = service().await?;
    let payload = object(json!({"name": "Gizmo & Co", "price": 2.5}));
    service.create("products", &payload).await?;

    let request = decompose(PREFIX, "/products", Some("name=Gizmo+%26+Co&price=2.5"))?;
    let found = rows(service.read(&request).await?);
    assert_eq!(found.len(), 1);
    Ok(())
}

#[tokio::test]
async fn raw_reads_and_writes() -> Result<()> {
    let service = service().await?;

    let written = service
        .raw("  INSERT INTO products (name) VALUES ('x'), ('y')  ")
        .await?;
    assert_eq!(written, Payload::Exec(ExecResult { rows_affected: 2 }));
    assert_eq!(service.pending_writes(), 1);

    let read = rows(service.raw("select count(*) AS n from products").await?);
    assert_eq!(read[0].get("n"), Some(&SqlValue::Int(2)));

    let pragma = rows(service.raw("PRAGMA table_info(products)").await?);
    assert_eq!(pragma.len(), 4);

    let err = service.raw("FOOBAR").await.unwrap_err();
    assert_eq!(err.message(), "unknown query type");
    let err = service.raw("   ").await.unwrap_err();
    assert_eq!(err.message(), "empty query");
    Ok(())
}

#[tokio::test]
async fn failed_writes_are_not_counted() -> Result<()> {
    let service = service().await?;
    let err = service
        .create("products", &object(json!({"price": 1.0})))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    let err = service
        .create("missing", &object(json!({"name": "x"})))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    assert_eq!(service.pending_writes(), 0);
    Ok(())
}

#[tokio::test]
async fn reserved_and_odd_identifiers_round_trip() -> Result<()> {
    let service = service().await?;
    service
        .raw(r#"CREATE TABLE "order" ("select" TEXT, "my col" INTEGER)"#)
        .await?;
    service
        .create("order", &object(json!({"select": "yes", "my col": 7})))
        .await?;

    let request = decompose(PREFIX, "/order", Some("my+col=7"))?;
    let found = rows(service.read(&request).await?);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("select"), Some(&SqlValue::Text("yes".into())));
    Ok(())
}

#[tokio::test]
async fn csv_rendering_of_a_read() -> Result<()> {
    let service = service().await?;
    service
        .create("products", &object(json!({"name": "Widget, large", "price": 1.5})))
        .await?;

    let payload = service.read(&decompose(PREFIX, "/products", None)?).await?;
    let format = ResponseFormat::from_accept(Some("text/csv"));
    let rendered = response::render_payload(format, 200, &payload);
    assert_eq!(rendered.content_type, "text/csv");
    assert_eq!(
        String::from_utf8(rendered.body)?,
        "id,name,price,note\n1,\"Widget, large\",1.5,null\n"
    );
    Ok(())
}

#[tokio::test]
async fn json_rendering_wraps_rows_in_data() -> Result<()> {
    let service = service().await?;
    service
        .create("products", &object(json!({"name": "Widget", "price": 2.0})))
        .await?;

    let payload = service.read(&decompose(PREFIX, "/products/1", None)?).await?;
    let rendered = response::render_payload(ResponseFormat::Json, 200, &payload);
    let body: Value = serde_json::from_slice(&rendered.body)?;
    assert_eq!(
        body,
        json!({"data": [{"id": 1, "name": "Widget", "price": 2.0, "note": null}]})
    );
    Ok(())
}

#[tokio::test]
async fn limit_and_offset_past_i64_are_ignored() -> Result<()> {
    let service = service().await?;
    for name in ["a", "b"] {
        service
            .create("products", &object(json!({ "name": name })))
            .await?;
    }

    let request = decompose(
        PREFIX,
        "/products",
        Some("__limit__=9223372036854775808&__offset__=18446744073709551615"),
    )?;
    assert_eq!(rows(service.read(&request).await?).len(), 2);

    let request = decompose(PREFIX, "/products", Some("__limit__=1&__offset__=1"))?;
    let found = rows(service.read(&request).await?);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("name"), Some(&SqlValue::Text("b".into())));
    Ok(())
}
