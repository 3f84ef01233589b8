//! YAML seed data for the static providers and the registration surface.

use crate::constraints::FormationConstraint;
use crate::engine::FormationEngine;
use crate::errors::Result;
use crate::providers::{ParticipantAttributes, StaticParticipants, StaticTenants, TenantRecord};
use crate::types::FormationTemplate;
use crate::webhooks::Webhook;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Attachment {
    pub constraint_id: String,
    pub template_id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Fixtures {
    pub participants: Vec<ParticipantAttributes>,
    pub tenants: Vec<TenantRecord>,
    pub formation_templates: Vec<FormationTemplate>,
    pub webhooks: Vec<Webhook>,
    pub constraints: Vec<FormationConstraint>,
    pub attachments: Vec<Attachment>,
}

#[derive(thiserror::Error, Debug)]
pub enum FixtureError {
    #[error("could not load fixtures from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse fixtures: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

impl Fixtures {
    pub fn from_file(path: &Path) -> std::result::Result<Self, FixtureError> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Seeds the providers, then registers templates, webhooks and constraints in
    /// that order so attachments and webhook owners resolve.
    pub fn apply(
        self,
        engine: &FormationEngine,
        participants: &StaticParticipants,
        tenants: &StaticTenants,
    ) -> Result<()> {
        let counts = (
            self.participants.len(),
            self.tenants.len(),
            self.webhooks.len(),
            self.constraints.len(),
        );
        for participant in self.participants {
            participants.insert(participant);
        }
        for tenant in self.tenants {
            tenants.insert(tenant);
        }
        for template in self.formation_templates {
            engine.register_formation_template(template)?;
        }
        for webhook in self.webhooks {
            engine.register_webhook(webhook)?;
        }
        for constraint in self.constraints {
            engine.create_constraint(constraint)?;
        }
        for attachment in self.attachments {
            engine.attach_constraint(&attachment.constraint_id, &attachment.template_id)?;
        }
        tracing::info!(
            participants = counts.0,
            tenants = counts.1,
            webhooks = counts.2,
            constraints = counts.3,
            "applied fixtures"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::providers::ParticipantProvider;
    use crate::testutils::TestHarness;
    use crate::types::{Participant, ParticipantKind};
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    const FIXTURES: &str = r#"
participants:
  - id: app1
    kind: APPLICATION
    name: App One
    subtype: app-type
    base_url: http://app1.local
tenants:
  - id: t9
    parent: customer9
formation_templates:
  - id: tpl-T
    name: T
    application_types: [app-type]
webhooks:
  - id: w1
    owner:
      type: APPLICATION
      id: app1
    type: APPLICATION_TENANT_MAPPING
    mode: ASYNC_CALLBACK
    url_template: '{"method":"POST","path":"http://app1.target.local/{{ .Assignment.ID }}"}'
constraints:
  - id: c1
    name: one formation per type
    constraint_type: PRE
    target_operation: AssignFormation
    operator: IsNotAssignedToAnyFormationOfType
    resource_type: APPLICATION
    resource_subtype: app-type
    scope: FORMATION_TYPE
attachments:
  - constraint_id: c1
    template_id: tpl-T
"#;

    #[tokio::test]
    async fn test_load_and_apply() {
        let tmp = write_tmp_file(FIXTURES);
        let fixtures = Fixtures::from_file(tmp.path()).expect("load fixtures");
        assert_eq!(fixtures.participants.len(), 1);
        assert_eq!(
            fixtures.attachments,
            vec![Attachment {
                constraint_id: "c1".into(),
                template_id: "tpl-T".into()
            }]
        );

        let harness = TestHarness::new();
        let engine = harness.engine();
        fixtures
            .apply(&engine, &harness.participants, &harness.tenants)
            .expect("apply fixtures");

        let app = harness
            .participants
            .participant("app1", ParticipantKind::Application)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(app.participant(), Participant::new("app1", ParticipantKind::Application));
        assert_eq!(app.base_url.as_deref(), Some("http://app1.local"));
        assert!(engine.formation_templates().iter().any(|t| t.id == "tpl-T"));
        assert_eq!(engine.list_constraints().len(), 1);

        engine.create_formation("t9", "F1", Some("T")).await.unwrap();
        engine.create_formation("t9", "F2", Some("T")).await.unwrap();
        engine.assign("t9", "F1", "app1", ParticipantKind::Application).await.unwrap();
        let err = engine
            .assign("t9", "F2", "app1", ParticipantKind::Application)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintDenied);
    }

    #[test]
    fn test_missing_and_invalid_files() {
        assert!(matches!(
            Fixtures::from_file(Path::new("/nonexistent/fixtures.yaml")),
            Err(FixtureError::LoadError(_))
        ));
        let tmp = write_tmp_file("webhooks: {not: a list}");
        assert!(matches!(
            Fixtures::from_file(tmp.path()),
            Err(FixtureError::ParseError(_))
        ));
    }

    #[test]
    fn test_unknown_attachment_template_fails() {
        let harness = TestHarness::new();
        let engine = harness.engine();
        let fixtures = Fixtures {
            attachments: vec![Attachment {
                constraint_id: "c1".into(),
                template_id: "missing".into(),
            }],
            ..Default::default()
        };
        let err = fixtures
            .apply(&engine, &harness.participants, &harness.tenants)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
