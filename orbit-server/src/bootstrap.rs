//! Startup discovery: turn the machine-model device table into the BPM set
//! the aggregator is built over.

use tracing::info;

use crate::aggregator::SourceSpec;
use crate::error::OrbitError;
use crate::transport::ModelFetch;

/// Device-name prefix selecting beam position monitors out of the model.
const BPM_PREFIX: &str = "BPMS";

/// Number of synthetic BPMs served in fake mode.
const FAKE_BPM_COUNT: usize = 101;

/// Fetches the model table behind `model_pv` and keeps the BPM rows, in
/// model order, pairing each device name with its longitudinal position.
pub async fn bpm_spec_from_model(
    model: &dyn ModelFetch,
    model_pv: &str,
    edef_suffix: &str,
) -> Result<SourceSpec, OrbitError> {
    let table = model
        .fetch(model_pv)
        .await
        .map_err(|source| OrbitError::Model {
            pv: model_pv.to_string(),
            source,
        })?;
    if table.device_name.len() != table.s.len() {
        return Err(OrbitError::MismatchedModel {
            names: table.device_name.len(),
            zs: table.s.len(),
        });
    }

    let mut names = Vec::new();
    let mut zs = Vec::new();
    for (name, z) in table.device_name.into_iter().zip(table.s) {
        if name.starts_with(BPM_PREFIX) {
            names.push(name);
            zs.push(z);
        }
    }
    if names.is_empty() {
        return Err(OrbitError::EmptyModel);
    }
    info!(model_pv, bpms = names.len(), "loaded BPM set from model");
    Ok(SourceSpec {
        names,
        zs,
        edef_suffix: edef_suffix.to_string(),
    })
}

/// The synthetic 101-BPM set used by `--fake` mode: `BPMS:LTUH:0` through
/// `BPMS:LTUH:100`, with `z` equal to the index.
pub fn fake_spec() -> SourceSpec {
    let names = (0..FAKE_BPM_COUNT)
        .map(|i| format!("BPMS:LTUH:{i}"))
        .collect();
    let zs = (0..FAKE_BPM_COUNT).map(|i| i as f64).collect();
    SourceSpec {
        names,
        zs,
        edef_suffix: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DeviceTable, TransportError};
    use async_trait::async_trait;

    struct FixedModel(DeviceTable);

    #[async_trait]
    impl ModelFetch for FixedModel {
        async fn fetch(&self, _model_pv: &str) -> Result<DeviceTable, TransportError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn keeps_only_bpm_rows_in_order() {
        let model = FixedModel(DeviceTable {
            device_name: vec![
                "QUAD:LTUH:120".into(),
                "BPMS:LTUH:120".into(),
                "XCOR:LTUH:130".into(),
                "BPMS:LTUH:140".into(),
            ],
            s: vec![1.0, 2.0, 3.0, 4.0],
        });
        let spec = bpm_spec_from_model(&model, "BMAD:SYS0:1:FULL_MACHINE", ":CUS1H")
            .await
            .unwrap();
        assert_eq!(spec.names, vec!["BPMS:LTUH:120", "BPMS:LTUH:140"]);
        assert_eq!(spec.zs, vec![2.0, 4.0]);
        assert_eq!(spec.edef_suffix, ":CUS1H");
    }

    #[tokio::test]
    async fn rejects_mismatched_columns() {
        let model = FixedModel(DeviceTable {
            device_name: vec!["BPMS:LTUH:120".into()],
            s: vec![],
        });
        let err = bpm_spec_from_model(&model, "MODEL", "")
            .await
            .unwrap_err();
        assert!(matches!(err, OrbitError::MismatchedModel { names: 1, zs: 0 }));
    }

    #[tokio::test]
    async fn rejects_bpm_free_model() {
        let model = FixedModel(DeviceTable {
            device_name: vec!["QUAD:LTUH:120".into()],
            s: vec![1.0],
        });
        let err = bpm_spec_from_model(&model, "MODEL", "").await.unwrap_err();
        assert!(matches!(err, OrbitError::EmptyModel));
    }

    #[test]
    fn fake_spec_is_101_bpms() {
        let spec = fake_spec();
        assert_eq!(spec.num_bpms(), 101);
        assert_eq!(spec.names[0], "BPMS:LTUH:0");
        assert_eq!(spec.names[100], "BPMS:LTUH:100");
        assert_eq!(spec.zs[100], 100.0);
    }
}
