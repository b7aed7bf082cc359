use crate::models::AttendanceStatus;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberAttendance {
    pub user_id: i32,
    pub present: u32,
    pub late: u32,
    pub absent: u32,
    pub excused: u32,
    /// Attended share of non-excused sessions, `None` when there were none.
    pub rate: Option<f64>,
}

impl MemberAttendance {
    fn record(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Excused => self.excused += 1,
        }
    }

    fn finish(mut self) -> Self {
        let attended = self.present + self.late;
        let counted = attended + self.absent;
        self.rate = (counted > 0).then(|| f64::from(attended) / f64::from(counted));
        self
    }
}

/// Per-member tallies; members with no records still get an entry.
pub fn summarize(
    members: &[i32],
    records: impl IntoIterator<Item = (i32, AttendanceStatus)>,
) -> Vec<MemberAttendance> {
    let mut tallies: BTreeMap<i32, MemberAttendance> = members
        .iter()
        .map(|&user_id| {
            (
                user_id,
                MemberAttendance {
                    user_id,
                    ..Default::default()
                },
            )
        })
        .collect();

    for (user_id, status) in records {
        tallies
            .entry(user_id)
            .or_insert_with(|| MemberAttendance {
                user_id,
                ..Default::default()
            })
            .record(status);
    }

    tallies.into_values().map(MemberAttendance::finish).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use AttendanceStatus::*;

    #[test]
    fn late_counts_as_attended_and_excused_is_ignored() {
        let summary = summarize(
            &[1],
            vec![(1, Present), (1, Late), (1, Absent), (1, Excused)],
        );
        assert_eq!(summary.len(), 1);
        let ada = &summary[0];
        assert_eq!((ada.present, ada.late, ada.absent, ada.excused), (1, 1, 1, 1));
        let rate = ada.rate.unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn members_without_records_have_no_rate() {
        let summary = summarize(&[1, 2], vec![(1, Excused)]);
        assert_eq!(summary[0].rate, None);
        assert_eq!(summary[1].user_id, 2);
        assert_eq!(summary[1].rate, None);
    }

    #[test]
    fn former_members_with_records_are_kept() {
        let summary = summarize(&[1], vec![(5, Present)]);
        assert_eq!(summary.iter().map(|m| m.user_id).collect::<Vec<_>>(), vec![1, 5]);
        assert_eq!(summary[1].rate, Some(1.0));
    }
}
