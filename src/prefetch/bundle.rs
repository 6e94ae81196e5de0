//! Named groups of resources warmed together.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// School terms, also used to discover the active term.
pub const SCHOOL_TERMS: &str = "/school-terms";

const USERS: &str = "/users";
const ROLES: &str = "/roles";
const DEPARTMENTS: &str = "/departments";
const STUDENTS: &str = "/students";
const PROGRAMS: &str = "/programs";
const COURSES: &str = "/courses";
const ASSIGNED_CLASSES: &str = "/section-courses/assigned";
const SECTIONS: &str = "/section-courses/sections";
const FACULTY: &str = "/section-courses/faculty";
const ANALYTICS: &str = "/assessments/dean-analytics/sample";

/// Freshness window for school terms
pub const TERMS_TTL: Duration = Duration::from_secs(30 * 60);
const DEPARTMENTS_TTL: Duration = Duration::from_secs(30 * 60);
const ANALYTICS_TTL: Duration = Duration::from_secs(10 * 60);
const STUDENTS_TTL: Duration = Duration::from_secs(10 * 60);
const CLASSES_TTL: Duration = Duration::from_secs(5 * 60);

/// Values that scope context-dependent resources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchContext {
  pub faculty_id: Option<String>,
  pub term_id: Option<String>,
}

impl PrefetchContext {
  pub fn with_faculty_id(mut self, id: impl Into<String>) -> Self {
    self.faculty_id = Some(id.into());
    self
  }

  pub fn with_term_id(mut self, id: impl Into<String>) -> Self {
    self.term_id = Some(id.into());
    self
  }
}

/// How a resource path depends on the prefetch context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
  /// Fixed path
  Fixed,
  /// Path followed by the faculty id; skipped without one
  Faculty,
  /// Path with the active term as `term_id`; unscoped without one
  Term,
}

/// A resource in a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
  pub path: String,
  pub scope: Scope,
  /// Freshness window, or the cache default when `None`
  pub ttl: Option<Duration>,
}

/// Concrete GET a resource resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
  pub path: String,
  pub params: Vec<(String, String)>,
  pub ttl: Option<Duration>,
}

impl ResourceRequest {
  fn new(path: impl Into<String>, ttl: Option<Duration>) -> Self {
    Self {
      path: path.into(),
      params: Vec::new(),
      ttl,
    }
  }

  pub fn params(&self) -> Vec<(&str, &str)> {
    self
      .params
      .iter()
      .map(|(k, v)| (k.as_str(), v.as_str()))
      .collect()
  }
}

impl Resource {
  fn scoped(path: &str, scope: Scope) -> Self {
    Self {
      path: path.to_string(),
      scope,
      ttl: None,
    }
  }

  pub fn path(path: &str) -> Self {
    Self::scoped(path, Scope::Fixed)
  }

  pub fn faculty_scoped(path: &str) -> Self {
    Self::scoped(path, Scope::Faculty)
  }

  pub fn term_scoped(path: &str) -> Self {
    Self::scoped(path, Scope::Term)
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  /// Resolve against `context`, or `None` if a required value is missing.
  pub fn request(&self, context: &PrefetchContext) -> Option<ResourceRequest> {
    match self.scope {
      Scope::Fixed => Some(ResourceRequest::new(self.path.as_str(), self.ttl)),
      Scope::Faculty => {
        let id = context.faculty_id.as_deref()?;
        Some(ResourceRequest::new(format!("{}/{}", self.path, id), self.ttl))
      }
      Scope::Term => {
        let mut request = ResourceRequest::new(self.path.as_str(), self.ttl);
        if let Some(term) = &context.term_id {
          request.params.push(("term_id".to_string(), term.clone()));
        }
        Some(request)
      }
    }
  }
}

impl fmt::Display for Resource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.scope {
      Scope::Fixed => write!(f, "{}", self.path),
      Scope::Faculty => write!(f, "{}/{{faculty_id}}", self.path),
      Scope::Term => write!(f, "{}?term_id={{term_id}}", self.path),
    }
  }
}

/// A named group of resources loaded together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
  pub name: String,
  pub resources: Vec<Resource>,
  /// Load the school terms first and scope the rest to the active term
  pub resolve_active_term: bool,
}

impl Bundle {
  pub fn new(name: impl Into<String>, resources: Vec<Resource>) -> Self {
    Self {
      name: name.into(),
      resources,
      resolve_active_term: false,
    }
  }

  pub fn resolving_active_term(mut self) -> Self {
    self.resolve_active_term = true;
    self
  }

  /// Bundles for every role.
  pub fn builtin() -> Vec<Bundle> {
    let terms = || Resource::path(SCHOOL_TERMS).with_ttl(TERMS_TTL);
    let departments = || Resource::path(DEPARTMENTS).with_ttl(DEPARTMENTS_TTL);
    let analytics = || Resource::term_scoped(ANALYTICS).with_ttl(ANALYTICS_TTL);
    let assigned = || Resource::path(ASSIGNED_CLASSES).with_ttl(CLASSES_TTL);

    vec![
      Bundle::new(
        Role::Admin.bundle_name(),
        vec![
          Resource::path(USERS),
          Resource::path(ROLES),
          departments(),
          terms(),
        ],
      ),
      Bundle::new(
        Role::Dean.bundle_name(),
        vec![terms(), analytics(), assigned()],
      )
      .resolving_active_term(),
      Bundle::new(
        Role::Staff.bundle_name(),
        vec![
          Resource::path(STUDENTS).with_ttl(STUDENTS_TTL),
          departments(),
          Resource::path(PROGRAMS),
          terms(),
          assigned(),
          Resource::path(COURSES),
          Resource::path(SECTIONS),
          Resource::path(FACULTY),
        ],
      ),
      Bundle::new(
        Role::Faculty.bundle_name(),
        vec![
          Resource::faculty_scoped(FACULTY).with_ttl(CLASSES_TTL),
          departments(),
        ],
      ),
      Bundle::new(
        Role::ProgramChair.bundle_name(),
        vec![
          terms(),
          analytics(),
          assigned(),
          Resource::path(PROGRAMS),
          Resource::path(COURSES),
          departments(),
        ],
      )
      .resolving_active_term(),
    ]
  }

  /// Requests this bundle resolves to under `context`, in declaration order.
  ///
  /// Resources that cannot be resolved are returned separately.
  pub fn requests(&self, context: &PrefetchContext) -> (Vec<ResourceRequest>, Vec<&Resource>) {
    let mut requests = Vec::new();
    let mut skipped = Vec::new();
    for resource in &self.resources {
      match resource.request(context) {
        Some(request) => requests.push(request),
        None => skipped.push(resource),
      }
    }
    (requests, skipped)
  }
}

/// User roles with a dedicated bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  Admin,
  Dean,
  Staff,
  Faculty,
  ProgramChair,
}

impl Role {
  pub fn bundle_name(self) -> &'static str {
    match self {
      Role::Admin => "admin-bundle",
      Role::Dean => "dean-bundle",
      Role::Staff => "staff-bundle",
      Role::Faculty => "faculty-bundle",
      Role::ProgramChair => "program-chair-bundle",
    }
  }
}

impl FromStr for Role {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
      "admin" => Ok(Role::Admin),
      "dean" => Ok(Role::Dean),
      "staff" => Ok(Role::Staff),
      "faculty" => Ok(Role::Faculty),
      "program-chair" => Ok(Role::ProgramChair),
      other => Err(format!("unknown role: {}", other)),
    }
  }
}

/// `term_id` of the active term in a school-terms response.
///
/// Accepts a bare array or one wrapped in a `data` field.
pub fn active_term_id(terms: &Value) -> Option<String> {
  let list = terms
    .as_array()
    .or_else(|| terms.get("data").and_then(Value::as_array))?;

  let active = list
    .iter()
    .find(|term| term.get("is_active").and_then(Value::as_bool) == Some(true))?;

  match active.get("term_id")? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}
