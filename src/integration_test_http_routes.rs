#[cfg(test)]
mod tests {
    use anyhow::Result;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
        Router,
    };
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::testing::{TestService, TEST_API_KEY};

    const BOUNDARY: &str = "filevault-test-boundary";

    fn multipart_body(field: &str, filename: &str, contents: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(contents);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(field: &str, filename: &str, contents: &[u8]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(header::AUTHORIZATION, format!("Bearer {TEST_API_KEY}"))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(field, filename, contents)))
            .unwrap()
    }

    fn authed(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TEST_API_KEY}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap()
    }

    fn public(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> Result<Response> {
        Ok(app.clone().oneshot(request).await?)
    }

    async fn body_bytes(response: Response) -> Result<Bytes> {
        Ok(response.into_body().collect().await?.to_bytes())
    }

    async fn body_json(response: Response) -> Result<Value> {
        Ok(serde_json::from_slice(&body_bytes(response).await?)?)
    }

    async fn upload(app: &Router, filename: &str, contents: &[u8]) -> Result<String> {
        let response = send(app, upload_request("file", filename, contents)).await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(String::from_utf8(body_bytes(response).await?.to_vec())?)
    }

    #[tokio::test]
    async fn test_root_index_is_public() -> Result<()> {
        let test_srv = TestService::new().await?;
        let response = send(&test_srv.routes(), public("GET", "/")).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await?.to_vec())?;
        assert!(text.contains("/upload"));
        assert!(text.contains("/files/{id}"));
        Ok(())
    }

    #[tokio::test]
    async fn test_openapi_document() -> Result<()> {
        let test_srv = TestService::new().await?;
        let response = send(&test_srv.routes(), public("GET", "/docs/openapi.json")).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let doc = body_json(response).await?;
        assert!(doc["paths"]["/upload"].is_object());
        assert!(doc["paths"]["/update/{id}"].is_object());
        Ok(())
    }

    #[tokio::test]
    async fn test_protected_routes_require_api_key() -> Result<()> {
        let test_srv = TestService::new().await?;
        let app = test_srv.routes();

        let response = send(&app, public("GET", "/files")).await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_bytes(response).await?, Bytes::from("Unauthorized"));

        for value in ["Bearer wrong", TEST_API_KEY, "Basic dGVzdA==", "Bearer"] {
            let request = Request::builder()
                .uri("/files")
                .header(header::AUTHORIZATION, value)
                .body(Body::empty())?;
            let response = send(&app, request).await?;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{value}");
        }

        let mut request = upload_request("file", "a.txt", b"a");
        request.headers_mut().remove(header::AUTHORIZATION);
        let response = send(&app, request).await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(test_srv.service.file_manager.list().await.is_empty());

        let response = send(&app, public("DELETE", "/delete/abc")).await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = send(&app, public("PUT", "/update/abc")).await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_lifecycle_over_http() -> Result<()> {
        let test_srv = TestService::new().await?;
        let app = test_srv.routes();
        let contents = vec![42u8; 100];

        let id = upload(&app, "report.pdf", &contents).await?;
        assert_eq!(id.len(), 64);

        let response = send(&app, authed("GET", "/files", Body::empty())).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let files = body_json(response).await?;
        assert_eq!(files.as_array().map(Vec::len), Some(1));
        assert_eq!(files[0]["id"], id.as_str());
        assert_eq!(files[0]["name"], "report.pdf");
        assert_eq!(files[0]["size"], 100);
        assert_eq!(files[0]["type"], "application/pdf");
        assert_eq!(files[0]["url"], format!("/files/{id}"));

        let response = send(&app, public("GET", &format!("/files/{id}"))).await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/pdf"
        );
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "100");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "inline; filename=\"report.pdf\""
        );
        assert_eq!(body_bytes(response).await?, Bytes::from(contents.clone()));

        let rename = Body::from(json!({"name": "summary.pdf"}).to_string());
        let response = send(&app, authed("PUT", &format!("/update/{id}"), rename)).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let renamed = body_json(response).await?;
        assert_eq!(renamed["id"], id.as_str());
        assert_eq!(renamed["name"], "summary.pdf");

        let response = send(&app, public("GET", &format!("/files/{id}"))).await?;
        assert_eq!(body_bytes(response).await?, Bytes::from(contents));

        let response = send(&app, authed("DELETE", &format!("/delete/{id}"), Body::empty())).await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await?, json!({"status": "deleted"}));

        let response = send(&app, public("GET", &format!("/files/{id}"))).await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = send(&app, authed("DELETE", &format!("/delete/{id}"), Body::empty())).await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&app, authed("GET", "/files", Body::empty())).await?;
        assert_eq!(body_json(response).await?, json!([]));
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_without_file_is_bad_request() -> Result<()> {
        let test_srv = TestService::new().await?;
        let app = test_srv.routes();

        let response = send(&app, upload_request("attachment", "a.txt", b"a")).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = authed("POST", "/upload", Body::from("not a form"));
        let response = send(&app, request).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert!(test_srv.service.file_manager.list().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_respects_allowed_types() -> Result<()> {
        let test_srv = TestService::with_config(|cfg| {
            cfg.upload.allowed_content_types =
                vec!["image/".to_string(), "application/pdf".to_string()];
        })
        .await?;
        let app = test_srv.routes();

        upload(&app, "photo.png", b"png").await?;
        upload(&app, "doc.pdf", b"pdf").await?;
        let response = send(&app, upload_request("file", "page.html", b"<html>")).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(test_srv.service.file_manager.list().await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_too_large() -> Result<()> {
        let test_srv = TestService::with_config(|cfg| cfg.upload.max_size_bytes = 1024).await?;
        let app = test_srv.routes();

        let response = send(&app, upload_request("file", "big.bin", &[0u8; 4096])).await?;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(test_srv.service.file_manager.list().await.is_empty());
        assert!(test_srv.service.blob_storage.list_keys().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_id_is_bad_request() -> Result<()> {
        let test_srv = TestService::new().await?;
        let app = test_srv.routes();

        let response = send(&app, public("GET", "/files/")).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = send(&app, authed("DELETE", "/delete/", Body::empty())).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = send(&app, authed("PUT", "/update/", Body::empty())).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn test_rename_errors() -> Result<()> {
        let test_srv = TestService::new().await?;
        let app = test_srv.routes();
        let id = upload(&app, "a.txt", b"a").await?;

        let response = send(&app, authed("PUT", &format!("/update/{id}"), Body::from("{"))).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let blank = Body::from(json!({"name": "  "}).to_string());
        let response = send(&app, authed("PUT", &format!("/update/{id}"), blank)).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let valid = Body::from(json!({"name": "b.txt"}).to_string());
        let response = send(&app, authed("PUT", "/update/unknown", valid)).await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let files = test_srv.service.file_manager.list().await;
        assert_eq!(files[0].original_name, "a.txt");
        Ok(())
    }

    #[tokio::test]
    async fn test_download_unknown_id() -> Result<()> {
        let test_srv = TestService::new().await?;
        let response = send(&test_srv.routes(), public("GET", "/files/nope")).await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_contents_is_server_error() -> Result<()> {
        let test_srv = TestService::new().await?;
        let record = test_srv.upload("a.txt", b"a").await?;
        test_srv
            .service
            .blob_storage
            .remove(record.storage_key())
            .await?;

        let uri = format!("/files/{}", record.id);
        let response = send(&test_srv.routes(), public("GET", &uri)).await?;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        Ok(())
    }
}
