use super::{
    PortalBackend, PortalStatus,
    escape::{html_attr, html_text, script_string},
};
use crate::{
    http_response::submit_error_response,
    services::{
        jobs::SubmitError,
        network::{ScannedNetwork, Secret, Security},
    },
};
use actix_web::{HttpResponse, Responder, http::header, web};
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::json;
use std::fmt::Write;

#[derive(Deserialize)]
pub struct ConnectPayload {
    ssid: String,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Deserialize)]
pub struct ForgetPayload {
    ssid: String,
}

impl ConnectPayload {
    fn into_parts(self) -> (String, Option<Secret>) {
        let secret = self.password.filter(|p| !p.is_empty()).map(Secret::new);
        (self.ssid, secret)
    }
}

/// Request handlers of the captive portal
#[derive(Clone)]
pub struct PortalApi<B: PortalBackend> {
    backend: B,
}

impl<B: PortalBackend> PortalApi<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn configure(cfg: &mut web::ServiceConfig) {
        cfg.route("/", web::get().to(Self::index))
            .route("/api/networks", web::get().to(Self::networks))
            .route("/api/status", web::get().to(Self::status))
            .route("/api/connect", web::post().to(Self::connect))
            .route("/connect", web::post().to(Self::connect_form))
            .route("/api/rescan", web::post().to(Self::rescan))
            .route("/api/saved", web::get().to(Self::saved_networks))
            .route("/api/delete", web::post().to(Self::forget_network))
            .default_service(web::route().to(Self::redirect_home));
    }

    pub async fn index(api: web::Data<Self>) -> impl Responder {
        debug!("index() called");

        let status = api.backend.status().await;
        let networks = api.backend.networks();

        HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .insert_header((header::CACHE_CONTROL, "no-store"))
            .body(render_page(&status, &networks))
    }

    pub async fn networks(api: web::Data<Self>) -> impl Responder {
        debug!("networks() called");
        HttpResponse::Ok().json(api.backend.networks())
    }

    pub async fn status(api: web::Data<Self>) -> impl Responder {
        debug!("status() called");
        HttpResponse::Ok().json(api.backend.status().await)
    }

    pub async fn connect(
        body: web::Json<ConnectPayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("connect() called");

        let (ssid, secret) = body.into_inner().into_parts();
        match api.backend.submit_credentials(ssid, secret).await {
            Ok(id) => HttpResponse::Accepted().json(json!({ "id": id })),
            Err(e) => submit_error_response(e),
        }
    }

    pub async fn connect_form(
        body: web::Form<ConnectPayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("connect_form() called");

        let (ssid, secret) = body.into_inner().into_parts();
        match api.backend.submit_credentials(ssid, secret).await {
            Ok(id) => {
                info!("portal credentials accepted as job {id}");
                HttpResponse::SeeOther()
                    .insert_header((header::LOCATION, "/"))
                    .finish()
            }
            Err(e) => {
                let page = format!(
                    "<!DOCTYPE html><html><body><p>{}</p><p><a href=\"/\">Back</a></p></body></html>",
                    html_text(&e.to_string())
                );
                let mut response = match e {
                    SubmitError::Busy { .. } => HttpResponse::Conflict(),
                    SubmitError::InvalidRequest(_) => HttpResponse::BadRequest(),
                };
                response
                    .content_type("text/html; charset=utf-8")
                    .body(page)
            }
        }
    }

    pub async fn rescan(api: web::Data<Self>) -> impl Responder {
        debug!("rescan() called");

        match api.backend.rescan() {
            Ok(id) => HttpResponse::Accepted().json(json!({ "id": id })),
            Err(e) => submit_error_response(e),
        }
    }

    pub async fn saved_networks(api: web::Data<Self>) -> impl Responder {
        debug!("saved_networks() called");

        match api.backend.saved_networks().await {
            Ok(ssids) => {
                let saved: Vec<_> = ssids.iter().map(|ssid| json!({ "ssid": ssid })).collect();
                HttpResponse::Ok().json(saved)
            }
            Err(e) => {
                error!("saved_networks failed: {e:#}");
                HttpResponse::InternalServerError().json(json!({ "error": e.to_string() }))
            }
        }
    }

    pub async fn forget_network(
        body: web::Json<ForgetPayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        let ssid = body.into_inner().ssid;
        debug!("forget_network() called: {ssid:?}");

        if ssid.trim().is_empty() {
            return HttpResponse::BadRequest().json(json!({ "error": "ssid must not be empty" }));
        }

        match api.backend.forget_network(ssid).await {
            Ok(true) => HttpResponse::Ok().json(json!({ "removed": true })),
            Ok(false) => HttpResponse::NotFound().json(json!({ "error": "unknown network" })),
            Err(e) => {
                error!("forget_network failed: {e:#}");
                HttpResponse::InternalServerError().json(json!({ "error": e.to_string() }))
            }
        }
    }

    /// Captive portal detection requests end up here
    pub async fn redirect_home() -> impl Responder {
        HttpResponse::Found()
            .insert_header((header::LOCATION, "/"))
            .finish()
    }
}

fn render_page(status: &PortalStatus, networks: &[ScannedNetwork]) -> String {
    let mut rows = String::new();
    for network in networks {
        let lock = match network.security {
            Security::Open => "open",
            Security::WpaPsk => "secured",
            Security::WpaEnterpriseUnsupported => "enterprise (unsupported)",
        };
        let _ = write!(
            rows,
            "<li><label><input type=\"radio\" name=\"ssid\" value=\"{}\"> {} \
             <small>{}% {}</small></label></li>",
            html_attr(&network.ssid),
            html_text(&network.ssid),
            network.signal_strength,
            lock,
        );
    }
    if networks.is_empty() {
        rows.push_str("<li>No networks found yet. Try a rescan.</li>");
    }

    let notice = match (&status.connecting_to, &status.last_error) {
        (Some(ssid), _) => format!("<p class=\"busy\">Connecting to {}…</p>", html_text(ssid)),
        (None, Some(error)) => format!(
            "<p class=\"error\">Last attempt failed: {}</p>",
            html_text(error)
        ),
        (None, None) => String::new(),
    };

    let last_ssid = status.connecting_to.as_deref().unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title} network setup</title>
</head>
<body>
<h1>Connect the arrival board</h1>
<p>State: {state}</p>
{notice}
<form method="post" action="/connect">
<ul>{rows}</ul>
<p><label>Other network <input type="text" name="ssid" id="other-ssid"></label></p>
<p><label>Password <input type="password" name="password"></label></p>
<p><button type="submit">Connect</button></p>
</form>
<form method="post" action="/api/rescan"><button type="submit">Rescan</button></form>
<script>
const lastSsid = "{last_ssid}";
if (lastSsid) {{ document.getElementById("other-ssid").placeholder = lastSsid; }}
</script>
</body>
</html>
"#,
        title = html_text(&status.access_point_ssid),
        state = status.state,
        notice = notice,
        rows = rows,
        last_ssid = script_string(last_ssid),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        jobs::ExclusivityGroup,
        portal::testing::StaticBackend,
    };
    use actix_web::{App, http::StatusCode, test};

    fn hostile_backend() -> StaticBackend {
        StaticBackend::new(vec![
            ScannedNetwork {
                ssid: r#""><script>alert(1)</script>"#.into(),
                signal_strength: 90,
                security: Security::Open,
            },
            ScannedNetwork {
                ssid: "HomeNet".into(),
                signal_strength: 60,
                security: Security::WpaPsk,
            },
        ])
    }

    macro_rules! portal {
        ($backend:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new(PortalApi::new($backend)))
                    .configure(PortalApi::<StaticBackend>::configure),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_index_escapes_ssids() {
        let app = portal!(hostile_backend());

        let req = test::TestRequest::get().uri("/").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let page = String::from_utf8(body.to_vec()).unwrap();

        assert!(!page.contains("<script>alert(1)"));
        assert!(page.contains("value=\"&quot;&gt;&lt;script&gt;alert(1)&lt;/script&gt;\""));
        assert!(page.contains("HomeNet"));
    }

    #[actix_web::test]
    async fn test_index_shows_last_failure() {
        let mut backend = hostile_backend();
        backend.status.last_error = Some("Secrets were required <wrong password>".into());
        let app = portal!(backend);

        let req = test::TestRequest::get().uri("/").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let page = String::from_utf8(body.to_vec()).unwrap();

        assert!(page.contains("Last attempt failed: Secrets were required &lt;wrong password&gt;"));
    }

    #[actix_web::test]
    async fn test_form_submission_redirects_home() {
        let backend = hostile_backend();
        let submitted = backend.submitted.clone();
        let app = portal!(backend);

        let req = test::TestRequest::post()
            .uri("/connect")
            .set_form([("ssid", "HomeNet"), ("password", "password123")])
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/");
        assert_eq!(
            submitted.lock().unwrap().as_slice(),
            [("HomeNet".to_string(), Some("password123".to_string()))]
        );
    }

    #[actix_web::test]
    async fn test_empty_password_means_open_network() {
        let backend = hostile_backend();
        let submitted = backend.submitted.clone();
        let app = portal!(backend);

        let req = test::TestRequest::post()
            .uri("/api/connect")
            .set_json(json!({ "ssid": "CoffeeShop", "password": "" }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(submitted.lock().unwrap()[0].1, None);
    }

    #[actix_web::test]
    async fn test_rejections_map_to_status_codes() {
        let mut backend = hostile_backend();
        backend.reject_with = Some(SubmitError::Busy {
            group: ExclusivityGroup::Network,
        });
        let app = portal!(backend);

        let req = test::TestRequest::post()
            .uri("/api/connect")
            .set_json(json!({ "ssid": "HomeNet", "password": "password123" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let mut backend = hostile_backend();
        backend.reject_with = Some(SubmitError::InvalidRequest("ssid must not be empty".into()));
        let app = portal!(backend);

        let req = test::TestRequest::post()
            .uri("/connect")
            .set_form([("ssid", "")])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_unknown_paths_redirect_to_portal() {
        let app = portal!(hostile_backend());

        for uri in ["/generate_204", "/hotspot-detect.html", "/connecttest.txt"] {
            let req = test::TestRequest::get().uri(uri).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::FOUND, "{uri}");
            assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/");
        }
    }

    #[actix_web::test]
    async fn test_saved_networks_can_be_forgotten() {
        let backend = hostile_backend();
        backend.saved.lock().unwrap().push("HomeNet".into());
        let saved = backend.saved.clone();
        let app = portal!(backend);

        let req = test::TestRequest::get().uri("/api/saved").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!([{ "ssid": "HomeNet" }]));

        let forget = |ssid: &str| {
            test::TestRequest::post()
                .uri("/api/delete")
                .set_json(json!({ "ssid": ssid }))
                .to_request()
        };
        assert_eq!(
            test::call_service(&app, forget("HomeNet")).await.status(),
            StatusCode::OK
        );
        assert!(saved.lock().unwrap().is_empty());
        assert_eq!(
            test::call_service(&app, forget("HomeNet")).await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            test::call_service(&app, forget(" ")).await.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[actix_web::test]
    async fn test_json_endpoints() {
        let app = portal!(hostile_backend());

        let req = test::TestRequest::get().uri("/api/status").to_request();
        let status: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status["state"], "portal-active");

        let req = test::TestRequest::get().uri("/api/networks").to_request();
        let networks: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(networks[1]["ssid"], "HomeNet");
        assert_eq!(networks[1]["security"], "wpa-psk");

        let req = test::TestRequest::post().uri("/api/rescan").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }
}
