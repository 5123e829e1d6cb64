//! A small melanoma study for unit tests.
//!
//! Six subjects, one specimen each, four cells per specimen in two
//! compartments. Subjects 0-2 are responders, 3-5 non-responders; every
//! specimen was extracted between two interventions.

use tessera_core::hash::sha256;
use tessera_spatial::shape::Polygon;
use tessera_spatial::signature::Polarity;

use crate::import::*;
use crate::store::Store;

pub const STUDY: &str = "Melanoma";
pub const COLLECTION: &str = "Melanoma - specimen collection";
pub const MEASUREMENT: &str = "Melanoma - measurement";
pub const SPECIMENS: usize = 6;

pub fn specimen(j: usize) -> String {
    format!("lesion {}_1", j)
}

pub fn manifest(j: usize) -> String {
    sha256(format!("manifest {}", j).as_bytes())
}

/// Channels 1..=3: CD3, CD8, SOX10. Positives per cell index.
const CELLS: [&[i64]; 4] = [&[3], &[1, 3], &[1, 2], &[1, 2]];

pub fn cells(j: usize) -> Vec<CellRecord> {
    CELLS
        .iter()
        .enumerate()
        .map(|(c, positives)| {
            let x = 10.0 * c as f64;
            CellRecord {
                structure: (j * CELLS.len() + c + 1) as i64,
                shape: Polygon::from_bounding_box(x, 0.0, x + 2.0, 2.0),
                compartment: Some(if c < 2 { "Tumor" } else { "Stroma" }.to_string()),
                quantifications: (1..=3)
                    .map(|channel| Quantification {
                        channel,
                        positive: positives.contains(&channel),
                        intensity: Some(channel as f64 * 10.0 + c as f64),
                    })
                    .collect(),
            }
        })
        .collect()
}

pub fn melanoma() -> Store {
    let mut store = Store::open_in_memory().unwrap();
    store
        .insert_study(&StudyRecord {
            name: STUDY.into(),
            institution: "Example Cancer Center".into(),
            collection_study: COLLECTION.into(),
            measurement_study: MEASUREMENT.into(),
        })
        .unwrap();

    let subjects: Vec<SubjectRecord> = (0..SPECIMENS)
        .map(|j| SubjectRecord {
            identifier: format!("patient {}", j),
            sex: None,
        })
        .collect();
    store.insert_subjects(&subjects).unwrap();

    let specimens: Vec<SpecimenRecord> = (0..SPECIMENS)
        .map(|j| SpecimenRecord {
            specimen: specimen(j),
            subject: format!("patient {}", j),
            extraction_date: "2019-01-01".into(),
            collection_study: COLLECTION.into(),
        })
        .collect();
    store.insert_specimens(&specimens).unwrap();

    let measurements: Vec<MeasurementRecord> = (0..SPECIMENS)
        .map(|j| MeasurementRecord {
            identifier: format!("{} measurement", specimen(j)),
            specimen: specimen(j),
            measurement_study: MEASUREMENT.into(),
            manifest_sha256: manifest(j),
            manifest_file_name: format!("{}.csv", specimen(j)),
            manifest_size: 1024,
        })
        .collect();
    store.insert_measurements(&measurements).unwrap();

    store
        .insert_channels(
            MEASUREMENT,
            &[
                ChannelRecord { identifier: 1, symbol: "CD3".into(), full_name: None },
                ChannelRecord { identifier: 2, symbol: "CD8".into(), full_name: None },
                ChannelRecord { identifier: 3, symbol: "SOX10".into(), full_name: None },
            ],
        )
        .unwrap();
    store
        .insert_phenotypes(
            MEASUREMENT,
            &[
                PhenotypeRecord {
                    identifier: "p1".into(),
                    name: "Cytotoxic T".into(),
                    criteria: vec![
                        (1, Polarity::Positive),
                        (2, Polarity::Positive),
                        (3, Polarity::Negative),
                    ],
                },
                PhenotypeRecord {
                    identifier: "p2".into(),
                    name: "Tumor".into(),
                    criteria: vec![(3, Polarity::Positive)],
                },
            ],
        )
        .unwrap();

    for j in 0..SPECIMENS {
        store.insert_cells(&manifest(j), &cells(j)).unwrap();
    }

    let interventions: Vec<InterventionRecord> = (0..SPECIMENS)
        .flat_map(|j| {
            ["2018-03-01", "2019-05-01"].map(|date| InterventionRecord {
                subject: format!("patient {}", j),
                specifier: "immunotherapy".into(),
                date: date.into(),
            })
        })
        .collect();
    store.insert_interventions(&interventions).unwrap();

    let diagnoses: Vec<DiagnosisRecord> = (0..SPECIMENS)
        .map(|j| DiagnosisRecord {
            subject: format!("patient {}", j),
            condition: "Response".into(),
            result: if j < 3 { "responder" } else { "non-responder" }.into(),
            date_of_evidence: "2019-06-01".into(),
        })
        .collect();
    store.insert_diagnoses(&diagnoses).unwrap();

    store
}
