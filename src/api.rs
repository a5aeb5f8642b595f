use crate::{
    http_response::handle_service_result,
    middleware::AuthMw,
    services::{
        auth::{PasswordService, TokenManager},
        jobs::{
            CancelOutcome, JobCoordinator, JobId,
            actions::{JobActions, JobRequest},
        },
        provisioning::{Provisioning, state::ProvisioningState},
        system_actions::CommandRunner,
    },
};
use actix_session::Session;
use actix_web::{HttpResponse, Responder, web};
use log::{debug, error};
use serde::Deserialize;
use serde_json::json;
use serde_valid::Validate;

#[derive(Deserialize, Validate)]
pub struct SetPasswordPayload {
    #[validate(min_length = 1)]
    password: String,
}

/// Handlers of the administrative HTTP surface
#[derive(Clone)]
pub struct Api<R: CommandRunner + Clone> {
    pub coordinator: JobCoordinator,
    pub actions: JobActions<R>,
    pub provisioning: Provisioning<R>,
    pub passwords: PasswordService,
}

impl<R: CommandRunner + Clone> Api<R> {
    pub fn new(
        coordinator: JobCoordinator,
        actions: JobActions<R>,
        provisioning: Provisioning<R>,
        passwords: PasswordService,
    ) -> Self {
        Api {
            coordinator,
            actions,
            provisioning,
            passwords,
        }
    }

    /// Register all admin routes; expects `Data<Self>`, `Data<TokenManager>`
    /// and `Data<PasswordService>` in the app data
    pub fn configure(cfg: &mut web::ServiceConfig) {
        cfg.route("/version", web::get().to(Self::version))
            .route("/healthcheck", web::get().to(Self::healthcheck))
            .route(
                "/require-set-password",
                web::get().to(Self::require_set_password),
            )
            .route("/set-password", web::post().to(Self::set_password))
            .route("/token/login", web::post().to(Self::token).wrap(AuthMw))
            .route("/token/refresh", web::get().to(Self::token).wrap(AuthMw))
            .route("/logout", web::post().to(Self::logout))
            .route("/provisioning", web::get().to(Self::provisioning_status))
            .route(
                "/provisioning/recheck",
                web::post().to(Self::recheck).wrap(AuthMw),
            )
            .service(
                web::resource("/jobs")
                    .route(web::post().to(Self::submit_job))
                    .route(web::get().to(Self::list_jobs))
                    .route(web::delete().to(Self::prune_jobs))
                    .wrap(AuthMw),
            )
            .route(
                "/jobs/history",
                web::get().to(Self::job_history).wrap(AuthMw),
            )
            .route("/jobs/{id}", web::get().to(Self::job_status).wrap(AuthMw))
            .route(
                "/jobs/{id}/cancel",
                web::post().to(Self::cancel_job).wrap(AuthMw),
            )
            .route(
                "/networks/scan",
                web::post().to(Self::scan_networks).wrap(AuthMw),
            )
            .route("/networks", web::get().to(Self::list_networks).wrap(AuthMw))
            .route(
                "/networks/{ssid}",
                web::delete().to(Self::delete_network).wrap(AuthMw),
            )
            .route(
                "/status/ssh-key",
                web::get().to(Self::ssh_key_status).wrap(AuthMw),
            )
            .route("/status/tls", web::get().to(Self::tls_status).wrap(AuthMw))
            .route(
                "/status/git-remote",
                web::get().to(Self::git_remote_status).wrap(AuthMw),
            );
    }

    pub async fn version() -> impl Responder {
        HttpResponse::Ok().body(env!("CARGO_PKG_VERSION"))
    }

    pub async fn healthcheck(api: web::Data<Self>) -> impl Responder {
        debug!("healthcheck() called");

        let state = api.provisioning.state();
        let body = json!({ "version": env!("CARGO_PKG_VERSION"), "provisioning": state });

        if state == ProvisioningState::Failed {
            HttpResponse::ServiceUnavailable().json(body)
        } else {
            HttpResponse::Ok().json(body)
        }
    }

    pub async fn require_set_password(api: web::Data<Self>) -> impl Responder {
        debug!("require_set_password() called");
        HttpResponse::Ok().json(!api.passwords.password_exists())
    }

    pub async fn set_password(
        body: web::Json<SetPasswordPayload>,
        api: web::Data<Self>,
        session: Session,
        token_manager: web::Data<TokenManager>,
    ) -> impl Responder {
        debug!("set_password() called");

        if api.passwords.password_exists() {
            return HttpResponse::Forbidden().body("password already set");
        }

        if let Err(e) = body.validate() {
            return HttpResponse::BadRequest().body(e.to_string());
        }

        if let Err(e) = api.passwords.store_or_update_password(&body.password) {
            error!("set_password failed: {e:#}");
            return HttpResponse::InternalServerError().body(e.to_string());
        }

        Self::session_token(session, token_manager)
    }

    pub async fn token(session: Session, token_manager: web::Data<TokenManager>) -> impl Responder {
        debug!("token() called");
        Self::session_token(session, token_manager)
    }

    pub async fn logout(session: Session) -> impl Responder {
        debug!("logout() called");
        session.purge();
        HttpResponse::Ok().finish()
    }

    pub async fn provisioning_status(api: web::Data<Self>) -> impl Responder {
        debug!("provisioning_status() called");
        HttpResponse::Ok().json(api.provisioning.status())
    }

    pub async fn recheck(api: web::Data<Self>) -> impl Responder {
        debug!("recheck() called");

        let result = api
            .provisioning
            .recheck()
            .await
            .map(|state| json!({ "state": state }));

        handle_service_result(result, "recheck")
    }

    pub async fn submit_job(body: web::Json<JobRequest>, api: web::Data<Self>) -> impl Responder {
        let request = body.into_inner();
        debug!("submit_job() called: {}", request.kind());

        let result = api
            .provisioning
            .submit_job(request)
            .await
            .map_err(anyhow::Error::from);

        handle_service_result(result, "submit_job")
    }

    pub async fn list_jobs(api: web::Data<Self>) -> impl Responder {
        debug!("list_jobs() called");
        HttpResponse::Ok().json(api.coordinator.list())
    }

    pub async fn prune_jobs(api: web::Data<Self>) -> impl Responder {
        debug!("prune_jobs() called");
        HttpResponse::Ok().json(json!({ "removed": api.coordinator.prune() }))
    }

    pub async fn job_history(api: web::Data<Self>) -> impl Responder {
        debug!("job_history() called");
        handle_service_result(api.coordinator.history().await, "job_history")
    }

    pub async fn job_status(path: web::Path<String>, api: web::Data<Self>) -> impl Responder {
        debug!("job_status() called: {path}");

        match path.parse::<JobId>().ok().and_then(|id| api.coordinator.status(id)) {
            Some(job) => HttpResponse::Ok().json(job),
            None => HttpResponse::NotFound().json(json!({ "error": "unknown job" })),
        }
    }

    pub async fn cancel_job(path: web::Path<String>, api: web::Data<Self>) -> impl Responder {
        debug!("cancel_job() called: {path}");

        let outcome = match path.parse::<JobId>() {
            Ok(id) => api.coordinator.cancel(id),
            Err(_) => CancelOutcome::Unknown,
        };

        handle_service_result(Ok(outcome), "cancel_job")
    }

    pub async fn scan_networks(api: web::Data<Self>) -> impl Responder {
        debug!("scan_networks() called");

        let result = api
            .actions
            .submit(&api.coordinator, JobRequest::ScanNetworks)
            .map_err(anyhow::Error::from);

        handle_service_result(result, "scan_networks")
    }

    pub async fn list_networks(api: web::Data<Self>) -> impl Responder {
        debug!("list_networks() called");
        handle_service_result(
            api.actions.network().profiles.summaries().await,
            "list_networks",
        )
    }

    pub async fn delete_network(path: web::Path<String>, api: web::Data<Self>) -> impl Responder {
        let ssid = path.into_inner();
        debug!("delete_network() called: {ssid:?}");

        match api.actions.network().forget(&ssid).await {
            Ok(true) => HttpResponse::Ok().finish(),
            Ok(false) => HttpResponse::NotFound().json(json!({ "error": "unknown network" })),
            Err(e) => handle_service_result::<()>(Err(e), "delete_network"),
        }
    }

    pub async fn ssh_key_status(api: web::Data<Self>) -> impl Responder {
        debug!("ssh_key_status() called");
        handle_service_result(api.actions.ssh_key_status().await, "ssh_key_status")
    }

    pub async fn tls_status(api: web::Data<Self>) -> impl Responder {
        debug!("tls_status() called");
        handle_service_result(api.actions.tls_status().await, "tls_status")
    }

    pub async fn git_remote_status(api: web::Data<Self>) -> impl Responder {
        debug!("git_remote_status() called");
        handle_service_result(api.actions.git_remote_status().await, "git_remote_status")
    }

    fn session_token(session: Session, token_manager: web::Data<TokenManager>) -> HttpResponse {
        let token = match token_manager.create_token() {
            Ok(token) => token,
            Err(e) => {
                error!("failed to create token: {e:#}");
                return HttpResponse::InternalServerError().body("failed to create token");
            }
        };

        if session.insert("token", &token).is_err() {
            error!("failed to insert token into session");
            return HttpResponse::InternalServerError().body("failed to insert token into session");
        }

        HttpResponse::Ok().body(token)
    }
}
