//! Route paths of the HTTP API.

pub const GET_HEALTH: &str = "/api/v1/health";

pub const GET_AUTH_GITHUB: &str = "/api/v1/auth/github";
pub const GET_AUTH_GITHUB_CALLBACK: &str = "/api/v1/auth/github/callback";
pub const GET_AUTH_ME: &str = "/api/v1/auth/me";
pub const POST_AUTH_REFRESH: &str = "/api/v1/auth/refresh";
pub const POST_AUTH_LOGOUT: &str = "/api/v1/auth/logout";

pub const GET_GITHUB_REPOS: &str = "/api/v1/github/repos";
pub const GET_GITHUB_FILES: &str = "/api/v1/github/files";
pub const POST_GITHUB_CREATE_PR: &str = "/api/v1/github/create-pr";

pub const POST_TESTCASES_GENERATE: &str = "/api/v1/testcases/generate";
pub const POST_TESTCASES_SAVE: &str = "/api/v1/testcases/save";
pub const GET_TESTCASES_JOBS: &str = "/api/v1/testcases/jobs";
pub const GET_TESTCASES_JOBS_ID: &str = "/api/v1/testcases/jobs/{id}";
pub const POST_TESTCASES_JOBS_ID_RETRY: &str = "/api/v1/testcases/jobs/{id}/retry";

/// Path scope of the OAuth client-session cookie.
pub const AUTH_SCOPE: &str = "/api/v1/auth";
