//! A lymphoma study populated through the public import writers.
//!
//! Six specimens of twelve cells on a 4x3 grid with 30 px spacing; the left
//! half is Tumor, the right half Stroma. CD3 and CD20 patterns are shared,
//! CD68 shifts with the specimen index.

use tessera_core::hash::sha256;
use tessera_spatial::shape::Polygon;
use tessera_spatial::signature::Polarity;
use tessera_store::import::*;
use tessera_store::Store;

pub const STUDY: &str = "Lymphoma";
const COLLECTION: &str = "Lymphoma - specimen collection";
const MEASUREMENT: &str = "Lymphoma - measurement";
pub const SPECIMENS: usize = 6;
const CELLS: usize = 12;

pub fn specimen(j: usize) -> String {
    format!("node {}", j)
}

fn manifest(j: usize) -> String {
    sha256(format!("lymphoma manifest {}", j).as_bytes())
}

fn cell(j: usize, c: usize) -> CellRecord {
    let (x, y) = (30.0 * (c % 4) as f64, 30.0 * (c / 4) as f64);
    let positive = [c % 3 == 0, c % 2 == 1, (c + j) % 4 == 0];
    CellRecord {
        structure: (j * CELLS + c + 1) as i64,
        shape: Polygon::from_bounding_box(x, y, x + 4.0, y + 4.0),
        compartment: Some(if c % 4 < 2 { "Tumor" } else { "Stroma" }.to_string()),
        quantifications: positive
            .iter()
            .enumerate()
            .map(|(i, &positive)| Quantification {
                channel: i as i64 + 1,
                positive,
                intensity: Some(if positive { 100.0 } else { 5.0 }),
            })
            .collect(),
    }
}

pub fn lymphoma() -> Store {
    let mut store = Store::open_in_memory().unwrap();
    store
        .insert_study(&StudyRecord {
            name: STUDY.into(),
            institution: "Example Lymphoma Center".into(),
            collection_study: COLLECTION.into(),
            measurement_study: MEASUREMENT.into(),
        })
        .unwrap();
    let subject = |j: usize| format!("subject {}", j);
    store
        .insert_subjects(
            &(0..SPECIMENS)
                .map(|j| SubjectRecord {
                    identifier: subject(j),
                    sex: None,
                })
                .collect::<Vec<_>>(),
        )
        .unwrap();
    store
        .insert_specimens(
            &(0..SPECIMENS)
                .map(|j| SpecimenRecord {
                    specimen: specimen(j),
                    subject: subject(j),
                    extraction_date: "2019-01-01".into(),
                    collection_study: COLLECTION.into(),
                })
                .collect::<Vec<_>>(),
        )
        .unwrap();
    store
        .insert_measurements(
            &(0..SPECIMENS)
                .map(|j| MeasurementRecord {
                    identifier: format!("{} imaging", specimen(j)),
                    specimen: specimen(j),
                    measurement_study: MEASUREMENT.into(),
                    manifest_sha256: manifest(j),
                    manifest_file_name: format!("node_{}.csv", j),
                    manifest_size: 2048,
                })
                .collect::<Vec<_>>(),
        )
        .unwrap();
    store
        .insert_channels(
            MEASUREMENT,
            &[
                ChannelRecord { identifier: 1, symbol: "CD3".into(), full_name: None },
                ChannelRecord { identifier: 2, symbol: "CD20".into(), full_name: None },
                ChannelRecord { identifier: 3, symbol: "CD68".into(), full_name: None },
            ],
        )
        .unwrap();
    store
        .insert_phenotypes(
            MEASUREMENT,
            &[PhenotypeRecord {
                identifier: "t".into(),
                name: "T cell".into(),
                criteria: vec![(1, Polarity::Positive), (2, Polarity::Negative)],
            }],
        )
        .unwrap();
    for j in 0..SPECIMENS {
        let cells: Vec<CellRecord> = (0..CELLS).map(|c| cell(j, c)).collect();
        store.insert_cells(&manifest(j), &cells).unwrap();
    }
    store
        .insert_interventions(
            &(0..SPECIMENS)
                .flat_map(|j| {
                    ["2018-03-01", "2019-05-01"].map(|date| InterventionRecord {
                        subject: subject(j),
                        specifier: "chemotherapy".into(),
                        date: date.into(),
                    })
                })
                .collect::<Vec<_>>(),
        )
        .unwrap();
    store
        .insert_diagnoses(
            &(0..SPECIMENS)
                .map(|j| DiagnosisRecord {
                    subject: subject(j),
                    condition: "Relapse".into(),
                    result: if j < 3 { "relapsed" } else { "remission" }.into(),
                    date_of_evidence: "2020-01-01".into(),
                })
                .collect::<Vec<_>>(),
        )
        .unwrap();
    store
}

/// Give specimen `j` a cell whose only call is on a channel the study never
/// registered.
pub fn add_unmapped_channel_cell(store: &mut Store, j: usize) {
    store
        .insert_cells(
            &manifest(j),
            &[CellRecord {
                structure: 10_000,
                shape: Polygon::from_bounding_box(0.0, 90.0, 4.0, 94.0),
                compartment: None,
                quantifications: vec![Quantification {
                    channel: 99,
                    positive: true,
                    intensity: None,
                }],
            }],
        )
        .unwrap();
}
