use std::sync::OnceLock;

use regex::Regex;

use crate::{
    error::{Error, Result},
    ids::PRESUBMIT_SYSTEM_CV,
    types::{BuildResult, ControlEntry, PresubmitResult},
};

fn project_re() -> &'static Regex {
    static PROJECT_RE: OnceLock<Regex> = OnceLock::new();
    PROJECT_RE.get_or_init(|| Regex::new(r"^[a-z0-9\-]{1,40}$").expect("valid project regex"))
}

fn subrealm_re() -> &'static Regex {
    static SUBREALM_RE: OnceLock<Regex> = OnceLock::new();
    SUBREALM_RE.get_or_init(|| Regex::new(r"^[a-z0-9_\.\-/]{1,400}$").expect("valid realm regex"))
}

pub fn is_valid_project(project: &str) -> bool {
    project_re().is_match(project)
}

pub fn is_valid_subrealm(name: &str) -> bool {
    subrealm_re().is_match(name)
}

/// Splits `project:subrealm` and validates both halves.
pub fn split_realm(realm: &str) -> Result<(&str, &str)> {
    let (project, sub) = realm
        .split_once(':')
        .ok_or_else(|| Error::InvalidArgument(format!("realm {realm:?} is not of the form project:subrealm")))?;
    if !is_valid_project(project) {
        return Err(Error::InvalidArgument(format!("realm {realm:?} has invalid project")));
    }
    if !is_valid_subrealm(sub) {
        return Err(Error::InvalidArgument(format!("realm {realm:?} has invalid subrealm")));
    }
    Ok((project, sub))
}

/// Checks a control entry before it is written.
pub fn validate_entry(e: &ControlEntry) -> Result<()> {
    if !is_valid_project(&e.project) {
        return Err(Error::InvalidArgument(format!("project {:?} must be valid", e.project)));
    }
    if e.build_id.host.is_empty() || e.build_id.id == 0 {
        return Err(Error::InvalidArgument("build ID must be specified".into()));
    }
    if let Some(b) = &e.build_result {
        validate_build_result(b).map_err(|err| Error::InvalidArgument(format!("build result: {err}")))?;
    }
    if let Some(p) = &e.presubmit_result {
        if !e.is_presubmit {
            return Err(Error::InvalidArgument(
                "presubmit result must not be set unless is_presubmit is set".into(),
            ));
        }
        validate_presubmit_result(p).map_err(|err| Error::InvalidArgument(format!("presubmit result: {err}")))?;
    }
    Ok(())
}

fn validate_build_result(r: &BuildResult) -> std::result::Result<(), &'static str> {
    if r.host.is_empty() {
        return Err("host must be specified");
    }
    if r.id == 0 {
        return Err("id must be specified");
    }
    Ok(())
}

fn validate_presubmit_result(r: &PresubmitResult) -> std::result::Result<(), &'static str> {
    if r.presubmit_run_id.system != PRESUBMIT_SYSTEM_CV {
        return Err("presubmit run system must be 'luci-cv'");
    }
    if r.presubmit_run_id.id.is_empty() {
        return Err("presubmit run system-specific ID must be specified");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BuildId, PresubmitMode, PresubmitRunId, RunOwner};
    use chrono::Utc;

    fn entry() -> ControlEntry {
        let now = Utc::now();
        ControlEntry {
            project: "chromium".into(),
            build_id: BuildId::new("host", 7),
            is_presubmit: false,
            build_result: Some(BuildResult {
                host: "host".into(),
                id: 7,
                project: "chromium".into(),
                creation_time: now,
            }),
            presubmit_result: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn valid_entry_passes() {
        validate_entry(&entry()).unwrap();
    }

    #[test]
    fn rejects_bad_project_and_missing_id() {
        let mut e = entry();
        e.project = "Not Valid".into();
        assert!(validate_entry(&e).is_err());

        let mut e = entry();
        e.build_id.id = 0;
        assert!(validate_entry(&e).is_err());
    }

    #[test]
    fn presubmit_result_requires_presubmit_entry() {
        let mut e = entry();
        e.presubmit_result = Some(PresubmitResult {
            presubmit_run_id: PresubmitRunId::cv("chromium", "r"),
            succeeded: true,
            owner: RunOwner::User,
            mode: PresubmitMode::FullRun,
            cls: vec![],
            creation_time: Utc::now(),
            critical: false,
        });
        assert!(validate_entry(&e).is_err());
        e.is_presubmit = true;
        validate_entry(&e).unwrap();
        if let Some(p) = e.presubmit_result.as_mut() {
            p.presubmit_run_id.system = "gerrit".into();
        }
        assert!(validate_entry(&e).is_err());
    }

    #[test]
    fn splits_realms() {
        assert_eq!(split_realm("chromium:ci").unwrap(), ("chromium", "ci"));
        assert!(split_realm("chromium").is_err());
        assert!(split_realm("Chromium:ci").is_err());
        assert!(split_realm("chromium:").is_err());
    }
}
