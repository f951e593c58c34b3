//! BizModel identity and Container/Pod mapping

use crate::models::{ArkBizInfo, BizModel, BIZ_VERSION_ENV};
use k8s_openapi::api::core::v1::{Container, Pod};

/// Anything that names a biz module by `(name, version)`
pub trait BizIdentity {
    fn biz_name(&self) -> &str;
    fn biz_version(&self) -> &str;

    /// `"<name>:<version>"`
    fn identity(&self) -> String {
        format!("{}:{}", self.biz_name(), self.biz_version())
    }
}

impl BizIdentity for BizModel {
    fn biz_name(&self) -> &str {
        &self.name
    }

    fn biz_version(&self) -> &str {
        &self.version
    }
}

impl BizIdentity for ArkBizInfo {
    fn biz_name(&self) -> &str {
        &self.name
    }

    fn biz_version(&self) -> &str {
        &self.version
    }
}

/// Identity key shared by desired descriptors and observed runtime info
pub fn identity_of<T: BizIdentity + ?Sized>(item: &T) -> String {
    item.identity()
}

/// True iff name and version both match; the artifact url is ignored
pub fn cmp_biz_model(a: &BizModel, b: &BizModel) -> bool {
    a.name == b.name && a.version == b.version
}

pub fn container_to_biz_model(container: &Container) -> BizModel {
    let version = container
        .env
        .as_ref()
        .and_then(|env| env.iter().find(|var| var.name == BIZ_VERSION_ENV))
        .and_then(|var| var.value.clone())
        .unwrap_or_default();

    BizModel {
        name: container.name.clone(),
        version,
        url: container.image.clone().unwrap_or_default(),
    }
}

/// One BizModel per container, in container order
pub fn pod_to_biz_models(pod: &Pod) -> Vec<BizModel> {
    pod.spec
        .as_ref()
        .map(|spec| spec.containers.iter().map(container_to_biz_model).collect())
        .unwrap_or_default()
}

/// `"<namespace>/<name>"`
pub fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BizState;
    use k8s_openapi::api::core::v1::{EnvVar, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn container(name: &str, image: &str, version: Option<&str>) -> Container {
        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            working_dir: Some("/home".to_string()),
            env: version.map(|v| {
                vec![EnvVar {
                    name: BIZ_VERSION_ENV.to_string(),
                    value: Some(v.to_string()),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_cmp_biz_model() {
        let models = [
            BizModel::new("test-biz1", "0.0.1", ""),
            BizModel::new("test-biz1", "0.0.2", ""),
            BizModel::new("test-biz2", "0.0.1", ""),
            BizModel::new("test-biz2", "0.0.2", ""),
        ];

        for (i, model) in models.iter().enumerate() {
            assert!(cmp_biz_model(model, model));
            for next in &models[i + 1..] {
                assert!(!cmp_biz_model(next, model));
            }
        }
    }

    #[test]
    fn test_cmp_biz_model_ignores_url() {
        let a = BizModel::new("biz", "1.0.0", "file:///a.jar");
        let b = BizModel::new("biz", "1.0.0", "file:///b.jar");
        assert!(cmp_biz_model(&a, &b));
    }

    #[test]
    fn test_identity_of_biz_info() {
        let info = ArkBizInfo {
            main_class: "Test".to_string(),
            web_context_path: "Test".to_string(),
            ..ArkBizInfo::new("test-biz", "1.1.1", BizState::parse("ACTIVATE"))
        };
        assert_eq!(identity_of(&info), "test-biz:1.1.1");
    }

    #[test]
    fn test_identity_of_biz_model() {
        let model = BizModel::new("test-biz", "0.0.1", "file:///test/test1.jar");
        assert_eq!(identity_of(&model), "test-biz:0.0.1");
    }

    #[test]
    fn test_container_to_biz_model() {
        let model =
            container_to_biz_model(&container("test_container", "file:///test/test1", Some("1.1.1")));
        assert_eq!(model.url, "file:///test/test1");
        assert_eq!(model.name, "test_container");
        assert_eq!(model.version, "1.1.1");
    }

    #[test]
    fn test_container_without_version_env() {
        let model = container_to_biz_model(&container("biz", "file:///biz.jar", None));
        assert_eq!(model.version, "");

        let model = container_to_biz_model(&Container {
            name: "bare".to_string(),
            ..Default::default()
        });
        assert_eq!(model.name, "bare");
        assert_eq!(model.url, "");
    }

    #[test]
    fn test_pod_to_biz_models_preserves_order() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![
                    container("test_container", "file:///test/test1", Some("1.1.1")),
                    container("test_container-2", "file:///test/test2", Some("1.1.2")),
                ],
                ..Default::default()
            }),
            ..Default::default()
        };

        let models = pod_to_biz_models(&pod);
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "test_container");
        assert_eq!(models[1].version, "1.1.2");
    }

    #[test]
    fn test_pod_without_spec() {
        assert!(pod_to_biz_models(&Pod::default()).is_empty());
    }

    #[test]
    fn test_pod_key() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("test-pod".to_string()),
                namespace: Some("test-namespace".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(pod_key(&pod), "test-namespace/test-pod");
    }
}
