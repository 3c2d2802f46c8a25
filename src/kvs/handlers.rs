//! KVS worker HTTP surface.
//!
//! Thin axum handlers over [`TableStore`]; replication forwarding is kicked
//! off here after an accepted cell write but never blocks the response.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, put};
use axum::Router;

use crate::error::Error;
use crate::kvs::protocol::*;
use crate::kvs::replication::ReplicationManager;
use crate::kvs::row::Row;
use crate::kvs::store::TableStore;

const VIEW_PAGE_SIZE: usize = 10;

pub fn router(store: Arc<TableStore>, replication: Arc<ReplicationManager>) -> Router {
    Router::new()
        .route("/data/:table", put(handle_put_row).get(handle_scan))
        .route("/data/:table/:row", get(handle_get_row).delete(handle_delete_row))
        .route(
            "/data/:table/:row/:column",
            put(handle_put_cell).get(handle_get_cell),
        )
        .route("/rename/:table", put(handle_rename))
        .route("/delete/:table", put(handle_delete_table))
        .route("/count/:table", get(handle_count))
        .route("/repl/tables", get(handle_repl_tables))
        .route("/repl/rows/:table", get(handle_repl_rows))
        .route("/", get(handle_dashboard))
        .route("/view/:table", get(handle_view))
        .layer(Extension(store))
        .layer(Extension(replication))
}

/// Maps the error taxonomy onto HTTP statuses: missing data is 404, rename
/// collisions 409, malformed requests 400, everything else 500.
pub(crate) fn error_response(e: Error) -> (StatusCode, String) {
    let status = match &e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::BadRequest(_) | Error::BadSubmission(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

async fn handle_put_row(
    Extension(store): Extension<Arc<TableStore>>,
    Extension(replication): Extension<Arc<ReplicationManager>>,
    Path(table): Path<String>,
    Query(params): Query<PutCellParams>,
    body: Bytes,
) -> Response {
    let row = match Row::decode(&body) {
        Ok(row) => row,
        Err(e) => {
            return error_response(Error::BadRequest(format!("malformed row: {e}"))).into_response()
        }
    };
    match store.put_row_versioned(&table, row.clone()) {
        Ok(version) => {
            if !params.replicated {
                let replication = replication.clone();
                tokio::spawn(async move {
                    replication.forward_row(&table, &row).await;
                });
            }
            (StatusCode::OK, [(VERSION_HEADER, version.to_string())], "OK").into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_put_cell(
    Extension(store): Extension<Arc<TableStore>>,
    Extension(replication): Extension<Arc<ReplicationManager>>,
    Path((table, row_key, column)): Path<(String, String, String)>,
    Query(params): Query<PutCellParams>,
    body: Bytes,
) -> Response {
    // Conditional write: read, compare, write only on match. The
    // check-then-act is not atomic against concurrent writers to the same
    // row; callers get last-write-wins semantics either way.
    if let (Some(ifcolumn), Some(equals)) = (&params.ifcolumn, &params.equals) {
        match store.get_row(&table, &row_key) {
            Ok(Some(existing)) => {
                if existing.get(ifcolumn) != Some(equals.as_str()) {
                    return (StatusCode::OK, "FAIL").into_response();
                }
            }
            Ok(None) => return (StatusCode::OK, "FAIL").into_response(),
            Err(e) => return error_response(e).into_response(),
        }
    }

    let value = body.to_vec();
    match store.put_cell(&table, &row_key, &column, value.clone()) {
        Ok(version) => {
            if !params.replicated {
                let replication = replication.clone();
                tokio::spawn(async move {
                    replication.forward_write(&table, &row_key, &column, &value).await;
                });
            }
            (StatusCode::OK, [(VERSION_HEADER, version.to_string())], "OK").into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_get_row(
    Extension(store): Extension<Arc<TableStore>>,
    Path((table, row_key)): Path<(String, String)>,
) -> Response {
    match store.get_row(&table, &row_key) {
        Ok(Some(row)) => (StatusCode::OK, row.encode()).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Not Found").into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_get_cell(
    Extension(store): Extension<Arc<TableStore>>,
    Path((table, row_key, column)): Path<(String, String, String)>,
    Query(params): Query<GetCellParams>,
) -> Response {
    let (row, version) = match params.version {
        Some(version) => match store.get_row_version(&table, &row_key, version) {
            Some(row) => (row, version),
            None => return (StatusCode::NOT_FOUND, "Not Found").into_response(),
        },
        None => match store.get_row(&table, &row_key) {
            Ok(Some(row)) => {
                let version = store.current_version(&table, &row_key);
                (row, version)
            }
            Ok(None) => return (StatusCode::NOT_FOUND, "Not Found").into_response(),
            Err(e) => return error_response(e).into_response(),
        },
    };
    match row.get_bytes(&column) {
        Some(data) => (
            StatusCode::OK,
            [(VERSION_HEADER, version.to_string())],
            data.to_vec(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

async fn handle_delete_row(
    Extension(store): Extension<Arc<TableStore>>,
    Path((table, row_key)): Path<(String, String)>,
) -> Response {
    match store.delete_row(&table, &row_key) {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// Streams the requested key range as blank-line separated encoded rows; a
/// double blank line terminates the stream.
async fn handle_scan(
    Extension(store): Extension<Arc<TableStore>>,
    Path(table): Path<String>,
    Query(params): Query<ScanParams>,
) -> Response {
    match store.scan(
        &table,
        params.start_row.as_deref(),
        params.end_row_exclusive.as_deref(),
    ) {
        Ok(rows) => {
            let mut body = Vec::new();
            for row in &rows {
                body.extend_from_slice(&row.encode());
                body.push(b'\n');
            }
            body.push(b'\n');
            (StatusCode::OK, body).into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_rename(
    Extension(store): Extension<Arc<TableStore>>,
    Path(table): Path<String>,
    body: Bytes,
) -> Response {
    let new_name = match std::str::from_utf8(&body) {
        Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => return error_response(Error::BadRequest("missing new table name".into())).into_response(),
    };
    match store.rename_table(&table, &new_name) {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_delete_table(
    Extension(store): Extension<Arc<TableStore>>,
    Path(table): Path<String>,
) -> Response {
    match store.delete_table(&table) {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_count(
    Extension(store): Extension<Arc<TableStore>>,
    Path(table): Path<String>,
) -> String {
    store.count(&table).to_string()
}

async fn handle_repl_tables(Extension(store): Extension<Arc<TableStore>>) -> String {
    let mut out = String::new();
    for name in store.table_names() {
        out.push_str(&name);
        out.push('\n');
    }
    out
}

async fn handle_repl_rows(
    Extension(store): Extension<Arc<TableStore>>,
    Path(table): Path<String>,
) -> String {
    let mut out = String::new();
    for (key, digest) in store.row_digests(&table) {
        out.push_str(&key);
        out.push(' ');
        out.push_str(&digest);
        out.push('\n');
    }
    out
}

async fn handle_dashboard(Extension(store): Extension<Arc<TableStore>>) -> Html<String> {
    let mut html = String::from(
        "<html><head><title>KVS Worker - Tables</title></head><body><h1>Tables</h1>\
         <table border=\"1\"><tr><th>Table Name</th><th>Number of Keys</th></tr>",
    );
    for name in store.table_names() {
        html.push_str(&format!(
            "<tr><td><a href=\"/view/{name}\">{name}</a></td><td>{}</td></tr>",
            store.count(&name)
        ));
    }
    html.push_str("</table></body></html>");
    Html(html)
}

async fn handle_view(
    Extension(store): Extension<Arc<TableStore>>,
    Path(table): Path<String>,
    Query(params): Query<ViewParams>,
) -> Response {
    let rows = match store.scan(&table, params.from_row.as_deref(), None) {
        Ok(rows) => rows,
        Err(e) => return error_response(e).into_response(),
    };

    let columns: BTreeSet<String> = rows
        .iter()
        .flat_map(|row| row.columns().map(|c| c.to_string()))
        .collect();

    let mut html = format!(
        "<html><head><title>Table: {table}</title></head><body><h1>Table: {table}</h1>\
         <table border=\"1\"><tr><th>Row Key</th>"
    );
    for column in &columns {
        html.push_str(&format!("<th>{column}</th>"));
    }
    html.push_str("</tr>");

    for row in rows.iter().take(VIEW_PAGE_SIZE) {
        html.push_str(&format!("<tr><td>{}</td>", row.key()));
        for column in &columns {
            html.push_str(&format!("<td>{}</td>", row.get(column).unwrap_or("")));
        }
        html.push_str("</tr>");
    }
    html.push_str("</table>");

    if let Some(next) = rows.get(VIEW_PAGE_SIZE) {
        html.push_str(&format!(
            "<br><a href=\"/view/{table}?fromRow={}\">Next</a>",
            encode_component(next.key())
        ));
    }
    html.push_str("</body></html>");
    Html(html).into_response()
}
