use crate::services::{
    jobs::{
        CancelOutcome, InvalidRequest, Job, JobId, JobSummary, SubmitError,
        actions::{GitRemoteStatus, SshKeyStatus, TlsStatus},
    },
    network::profiles::ProfileSummary,
    provisioning::ProvisioningError,
    store::StoreError,
};
use actix_web::HttpResponse;
use anyhow::Result;
use log::{error, warn};
use serde_json::json;

/// Trait for converting service results into HTTP responses
pub trait ServiceResultResponse {
    fn into_response(self) -> HttpResponse;
}

impl ServiceResultResponse for () {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().finish()
    }
}

impl ServiceResultResponse for String {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().body(self)
    }
}

/// A job was accepted and runs in the background
impl ServiceResultResponse for JobId {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Accepted().json(json!({ "id": self }))
    }
}

impl ServiceResultResponse for CancelOutcome {
    fn into_response(self) -> HttpResponse {
        let body = json!({ "outcome": self });
        match self {
            CancelOutcome::Accepted => HttpResponse::Accepted().json(body),
            CancelOutcome::TooLate => HttpResponse::Conflict().json(body),
            CancelOutcome::Unknown => HttpResponse::NotFound().json(body),
        }
    }
}

macro_rules! json_response {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl ServiceResultResponse for $ty {
                fn into_response(self) -> HttpResponse {
                    HttpResponse::Ok().json(self)
                }
            }
        )+
    };
}

json_response!(
    Job,
    Vec<Job>,
    Vec<JobSummary>,
    Vec<ProfileSummary>,
    SshKeyStatus,
    TlsStatus,
    GitRemoteStatus,
    serde_json::Value,
);

/// Map a rejected submission to 409 or 400
pub fn submit_error_response(e: SubmitError) -> HttpResponse {
    match e {
        SubmitError::Busy { group } => {
            HttpResponse::Conflict().json(json!({ "error": "busy", "group": group }))
        }
        SubmitError::InvalidRequest(message) => HttpResponse::BadRequest()
            .json(json!({ "error": "invalid-request", "message": message })),
    }
}

/// Handle Result and convert data or error to a response
///
/// Typed errors anywhere in the chain decide the status code: busy groups
/// and invalid transitions are 409, invalid requests 400, everything else
/// including corrupt store records 500.
///
/// # Arguments
/// * `result` - The Result to handle
/// * `operation` - Name of the operation for the error log
pub fn handle_service_result<T>(result: Result<T>, operation: &str) -> HttpResponse
where
    T: ServiceResultResponse,
{
    let e = match result {
        Ok(data) => return data.into_response(),
        Err(e) => e,
    };

    if let Some(e) = e.downcast_ref::<SubmitError>() {
        warn!("{operation} rejected: {e}");
        return submit_error_response(e.clone());
    }
    if let Some(InvalidRequest(message)) = e.downcast_ref::<InvalidRequest>() {
        warn!("{operation} rejected: {message}");
        return HttpResponse::BadRequest()
            .json(json!({ "error": "invalid-request", "message": message }));
    }
    if let Some(e) = e.downcast_ref::<ProvisioningError>() {
        if matches!(
            e,
            ProvisioningError::InvalidTransition(_) | ProvisioningError::Busy(_)
        ) {
            warn!("{operation} rejected: {e}");
            return HttpResponse::Conflict().json(json!({ "error": e.to_string() }));
        }
    }
    if let Some(StoreError::Busy { .. }) = e.downcast_ref::<StoreError>() {
        warn!("{operation} failed: {e:#}");
        return HttpResponse::Conflict().json(json!({ "error": "busy" }));
    }

    error!("{operation} failed: {e:#}");
    HttpResponse::InternalServerError().body(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{jobs::ExclusivityGroup, provisioning::state::*};
    use actix_web::{body::to_bytes, http::StatusCode};
    use anyhow::Context;

    async fn body(response: HttpResponse) -> serde_json::Value {
        serde_json::from_slice(&to_bytes(response.into_body()).await.unwrap()).unwrap()
    }

    #[actix_web::test]
    async fn test_busy_is_conflict() {
        let result: Result<()> = Err(SubmitError::Busy {
            group: ExclusivityGroup::System,
        })
        .context("failed to submit job");

        let response = handle_service_result(result, "submit_job");

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            body(response).await,
            json!({ "error": "busy", "group": "system" })
        );
    }

    #[actix_web::test]
    async fn test_error_mapping() {
        let status = |result: Result<()>| handle_service_result(result, "test").status();

        assert_eq!(
            status(Err(InvalidRequest("bad".into()).into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(Err(ProvisioningError::InvalidTransition(InvalidTransition {
                from: ProvisioningState::PortalActive,
                event: ProvisioningEvent::Recheck,
            })
            .into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(Err(StoreError::Corrupt {
                key: "networks".into(),
                reason: "expected value".into(),
            }
            .into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(Err(ProvisioningError::NoHardware.into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_cancel_outcomes() {
        assert_eq!(
            CancelOutcome::Accepted.into_response().status(),
            StatusCode::ACCEPTED
        );
        assert_eq!(
            CancelOutcome::TooLate.into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            CancelOutcome::Unknown.into_response().status(),
            StatusCode::NOT_FOUND
        );
    }
}
