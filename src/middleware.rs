use crate::services::auth::{PasswordService, TokenManager};
use actix_session::SessionExt;
use actix_web::{
    Error, FromRequest, HttpMessage, HttpResponse,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    http::header,
    web::Data,
};
use actix_web_httpauth::extractors::basic::BasicAuth;
use anyhow::Result;
use log::{debug, error};
use std::{
    future::{Future, Ready, ready},
    pin::Pin,
    rc::Rc,
};

/// Requires a bearer token, a session token or the admin password
pub struct AuthMw;

impl<S, B> Transform<S, ServiceRequest> for AuthMw
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct AuthMiddleware<S> {
    service: Rc<S>,
}

type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static>>;

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();

        Box::pin(async move {
            let Some(token_manager) = req.app_data::<Data<TokenManager>>().cloned() else {
                error!("token manager missing from app data");
                let http_res = HttpResponse::InternalServerError().finish();
                let (http_req, _) = req.into_parts();
                return Ok(ServiceResponse::new(http_req, http_res).map_into_right_body());
            };

            if let Some(token) = bearer_token(&req) {
                return if token_manager.verify_token(&token) {
                    let res = service.call(req).await?;
                    Ok(res.map_into_left_body())
                } else {
                    debug!("rejected bearer token");
                    Ok(unauthorized_error(req).map_into_right_body())
                };
            }

            let token = match req.get_session().get::<String>("token") {
                Ok(token) => token.unwrap_or_default(),
                Err(e) => {
                    error!("failed to get session. {e:#}");
                    String::new()
                }
            };

            if !token.is_empty() && token_manager.verify_token(&token) {
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            }

            let mut payload = req.take_payload().take();

            let Ok(auth) = BasicAuth::from_request(req.request(), &mut payload).await else {
                return Ok(unauthorized_error(req).map_into_right_body());
            };

            let verified = req
                .app_data::<Data<PasswordService>>()
                .is_some_and(|passwords| verify_user(passwords, &auth));

            if verified {
                let res = service.call(req).await?;
                Ok(res.map_into_left_body())
            } else {
                Ok(unauthorized_error(req).map_into_right_body())
            }
        })
    }
}

fn bearer_token(req: &ServiceRequest) -> Option<String> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();

    (!token.is_empty()).then(|| token.to_string())
}

pub fn verify_user(passwords: &PasswordService, auth: &BasicAuth) -> bool {
    let Some(password) = auth.password() else {
        return false;
    };

    if let Err(e) = passwords.validate_password(password) {
        error!("verify_user() failed: {e:#}");
        return false;
    }

    true
}

fn unauthorized_error(req: ServiceRequest) -> ServiceResponse {
    let http_res = HttpResponse::Unauthorized().finish();
    let (http_req, _) = req.into_parts();
    ServiceResponse::new(http_req, http_res)
}
