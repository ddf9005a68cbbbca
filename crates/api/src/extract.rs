use axum::{extract::FromRequestParts, http::request::Parts};

use taskhub_domain::{Principal, Tenant};

use crate::error::ApiError;

pub const HEADER_COMPANY: &str = "x-tenant-company";
pub const HEADER_BRAND: &str = "x-tenant-brand";
pub const HEADER_PRINCIPAL: &str = "x-principal";
pub const HEADER_ROLES: &str = "x-roles";

/// 由上游认证网关注入的调用方身份
#[derive(Debug, Clone)]
pub struct Caller {
    pub tenant: Tenant,
    pub principal: Principal,
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let company = header(parts, HEADER_COMPANY).ok_or(ApiError::MissingHeader("X-Tenant-Company"))?;
        let principal_id = header(parts, HEADER_PRINCIPAL).ok_or(ApiError::MissingHeader("X-Principal"))?;

        let tenant = match header(parts, HEADER_BRAND) {
            Some(brand) => Tenant::with_brand(company, brand),
            None => Tenant::company(company),
        };
        let mut principal = Principal::new(principal_id, company);
        if let Some(roles) = header(parts, HEADER_ROLES) {
            for role in roles.split(',').map(str::trim).filter(|r| !r.is_empty()) {
                principal = principal.with_role(role);
            }
        }
        Ok(Self { tenant, principal })
    }
}
