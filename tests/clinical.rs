use std::fs;

use assert_matches::assert_matches;
use chrono::NaiveDate;

use livingpark_utils::clinical::{
    DiagnosisRecord, ExamRecord, disease_duration, moca_to_mmse, month_difference,
    parse_ppmi_date, read_diagnosis_history, read_updrs_part_iii, write_disease_durations,
};
use livingpark_utils::error::LivingParkError;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn moca_to_mmse_table() {
    let expected = [
        (0, 0),
        (1, 6),
        (7, 15),
        (8, 15),
        (12, 18),
        (20, 25),
        (26, 29),
        (28, 30),
        (30, 30),
    ];
    for (moca, mmse) in expected {
        assert_eq!(moca_to_mmse(moca).unwrap(), mmse, "MoCA {moca}");
    }
    assert_eq!(moca_to_mmse(26).unwrap(), moca_to_mmse(26).unwrap());
}

#[test]
fn moca_score_above_range_is_rejected() {
    assert_matches!(moca_to_mmse(31), Err(LivingParkError::InvalidMocaScore(31)));
}

#[test]
fn parse_dates() {
    assert_eq!(parse_ppmi_date("03/2015").unwrap(), date(2015, 3, 1));
    assert_eq!(parse_ppmi_date("2015-03").unwrap(), date(2015, 3, 1));
    assert_eq!(parse_ppmi_date("2015-03-17").unwrap(), date(2015, 3, 17));
    assert_eq!(parse_ppmi_date("03/17/2015").unwrap(), date(2015, 3, 17));
    assert_matches!(parse_ppmi_date("13/2015"), Err(LivingParkError::InvalidDate(_)));
    assert_matches!(parse_ppmi_date("soon"), Err(LivingParkError::InvalidDate(_)));
}

#[test]
fn months_between_visits() {
    assert_eq!(month_difference(date(2012, 6, 1), date(2010, 1, 1)), 29);
    assert_eq!(month_difference(date(2010, 1, 1), date(2012, 6, 1)), 29);
    assert_eq!(month_difference(date(2012, 6, 1), date(2012, 6, 1)), 0);
}

#[test]
fn months_clip_to_the_end_of_shorter_months() {
    assert_eq!(month_difference(date(2020, 2, 29), date(2020, 1, 31)), 1);
    assert_eq!(month_difference(date(2020, 4, 30), date(2020, 3, 31)), 1);
    assert_eq!(month_difference(date(2021, 2, 28), date(2021, 1, 31)), 1);
    assert_eq!(month_difference(date(2020, 2, 28), date(2020, 1, 31)), 0);
    assert_eq!(month_difference(date(2021, 3, 30), date(2020, 3, 31)), 11);
}

#[test]
fn duration_from_screening_diagnosis() {
    let diagnoses = vec![
        DiagnosisRecord {
            patno: "3001".to_string(),
            event_id: "SC".to_string(),
            diagnosis_date: Some("01/2010".to_string()),
        },
        DiagnosisRecord {
            patno: "3001".to_string(),
            event_id: "V04".to_string(),
            diagnosis_date: Some("01/2000".to_string()),
        },
        DiagnosisRecord {
            patno: "3002".to_string(),
            event_id: "SC".to_string(),
            diagnosis_date: None,
        },
    ];
    let exams = vec![
        ExamRecord {
            patno: "3001".to_string(),
            event_id: "BL".to_string(),
            exam_date: Some("07/2011".to_string()),
        },
        ExamRecord {
            patno: "3002".to_string(),
            event_id: "BL".to_string(),
            exam_date: Some("07/2011".to_string()),
        },
    ];

    let rows = disease_duration(&diagnoses, &exams).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].months, Some(18));
    assert_eq!(rows[1].months, None);
}

#[test]
fn reads_study_files_and_writes_durations() {
    let temp = tempfile::tempdir().unwrap();
    let diagnosis = temp.path().join("PD_Diagnosis_History.csv");
    let updrs = temp.path().join("MDS-UPDRS_Part_III.csv");
    fs::write(
        &diagnosis,
        "REC_ID,PATNO,EVENT_ID,PAG_NAME,PDDXDT\n1,3001,SC,PDDXHIST,03/2011\n2,3002,SC,PDDXHIST,\n",
    )
    .unwrap();
    fs::write(
        &updrs,
        "REC_ID,PATNO,EVENT_ID,INFODT,NP3TOT\n1,3001,BL,04/2012,20\n2,3001,V04,05/2013,22\n3,3002,BL,04/2012,10\n",
    )
    .unwrap();

    let diagnoses = read_diagnosis_history(&diagnosis).unwrap();
    assert_eq!(diagnoses[1].diagnosis_date, None);
    let exams = read_updrs_part_iii(&updrs).unwrap();
    let rows = disease_duration(&diagnoses, &exams).unwrap();
    assert_eq!(
        rows.iter().map(|row| row.months).collect::<Vec<_>>(),
        vec![Some(13), Some(26), None]
    );

    let output = temp.path().join("durations.csv");
    write_disease_durations(&output, &rows).unwrap();
    let written = fs::read_to_string(&output).unwrap();
    assert!(written.starts_with("PATNO,EVENT_ID,PDXDUR\n3001,BL,13\n"));
    assert!(written.ends_with("3002,BL,\n"));
}

#[test]
fn missing_column_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let updrs = temp.path().join("MDS-UPDRS_Part_III.csv");
    fs::write(&updrs, "PATNO,EVENT_ID\n3001,BL\n").unwrap();
    let err = read_updrs_part_iii(&updrs).unwrap_err();
    assert_matches!(err, LivingParkError::MissingColumn { column, .. } if column == "INFODT");
}
