use crate::schema::*;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

diesel::sql_function!(fn lower(x: diesel::sql_types::Text) -> diesel::sql_types::Text);

/// Declares an enum stored as an upper-case `VARCHAR` column.
macro_rules! db_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(anyhow::anyhow!(
                        concat!("unknown ", stringify!($name), " `{}`"),
                        other
                    )),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

db_enum!(UserRole {
    Student => "STUDENT",
    Admin => "ADMIN",
});

db_enum!(ClubStatus {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
});

db_enum!(
    /// Ordered from least to most privileged.
    #[derive(PartialOrd, Ord)]
    ClubRole {
        Member => "MEMBER",
        Officer => "OFFICER",
        Leader => "LEADER",
    }
);

db_enum!(RequestStatus {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
});

db_enum!(AttendanceStatus {
    Present => "PRESENT",
    Absent => "ABSENT",
    Late => "LATE",
    Excused => "EXCUSED",
});

db_enum!(ReportTarget {
    Post => "POST",
    Comment => "COMMENT",
    Club => "CLUB",
});

db_enum!(ReportStatus {
    Open => "OPEN",
    Resolved => "RESOLVED",
    Dismissed => "DISMISSED",
});

db_enum!(NotificationKind {
    ClubSubmitted => "CLUB_SUBMITTED",
    ClubApproved => "CLUB_APPROVED",
    ClubRejected => "CLUB_REJECTED",
    JoinRequested => "JOIN_REQUESTED",
    JoinReviewed => "JOIN_REVIEWED",
    LeaveRequested => "LEAVE_REQUESTED",
    LeaveReviewed => "LEAVE_REVIEWED",
    NewPost => "NEW_POST",
    NewComment => "NEW_COMMENT",
    RoleChanged => "ROLE_CHANGED",
    Removed => "REMOVED",
    SessionCreated => "SESSION_CREATED",
});

impl RequestStatus {
    /// Moves a pending request to its reviewed state.
    pub fn review(self, approve: bool) -> Option<RequestStatus> {
        match self {
            RequestStatus::Pending if approve => Some(RequestStatus::Approved),
            RequestStatus::Pending => Some(RequestStatus::Rejected),
            _ => None,
        }
    }
}

impl ReportStatus {
    pub fn close(self, resolve: bool) -> Option<ReportStatus> {
        match self {
            ReportStatus::Open if resolve => Some(ReportStatus::Resolved),
            ReportStatus::Open => Some(ReportStatus::Dismissed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i32,
    #[serde(skip)]
    pub google_id: String,
    pub email: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub role: String,
    pub created_at: NaiveDateTime,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin.as_str()
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Club {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub logo_url: Option<String>,
    pub status: String,
    pub rejection_reason: Option<String>,
    pub created_by: i32,
    pub created_at: NaiveDateTime,
}

impl Club {
    pub fn status(&self) -> anyhow::Result<ClubStatus> {
        self.status.parse()
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize)]
#[diesel(belongs_to(Club))]
#[diesel(belongs_to(User))]
#[serde(rename_all = "camelCase")]
pub struct ClubMember {
    pub id: i32,
    pub club_id: i32,
    pub user_id: i32,
    pub role: String,
    pub joined_at: NaiveDateTime,
}

impl ClubMember {
    pub fn role(&self) -> anyhow::Result<ClubRole> {
        self.role.parse()
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize)]
#[diesel(belongs_to(Club))]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: i32,
    pub club_id: i32,
    pub author_id: i32,
    pub content: String,
    pub image_url: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize)]
#[diesel(belongs_to(Post))]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: i32,
    pub post_id: i32,
    pub author_id: i32,
    pub content: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub id: i32,
    pub club_id: i32,
    pub user_id: i32,
    pub message: Option<String>,
    pub status: String,
    pub reviewed_by: Option<i32>,
    pub reviewed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    pub id: i32,
    pub club_id: i32,
    pub user_id: i32,
    pub reason: Option<String>,
    pub status: String,
    pub reviewed_by: Option<i32>,
    pub reviewed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Identifiable, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClubSchedule {
    pub id: i32,
    pub club_id: i32,
    pub title: String,
    pub room: String,
    pub day_of_week: i16,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize)]
#[diesel(belongs_to(Club))]
#[serde(rename_all = "camelCase")]
pub struct ActivitySession {
    pub id: i32,
    pub club_id: i32,
    pub title: String,
    pub session_date: NaiveDate,
    pub created_by: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize)]
#[diesel(belongs_to(ActivitySession, foreign_key = session_id))]
#[serde(rename_all = "camelCase")]
pub struct Attendance {
    pub id: i32,
    pub session_id: i32,
    pub user_id: i32,
    pub status: String,
    pub recorded_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: i32,
    pub reporter_id: i32,
    pub target_type: String,
    pub target_id: i32,
    pub reason: String,
    pub status: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i32,
    pub user_id: i32,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub read: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
pub struct PushSubscription {
    pub id: i32,
    pub user_id: i32,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub created_at: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn club_roles_are_ordered_by_privilege() {
        assert!(ClubRole::Leader > ClubRole::Officer);
        assert!(ClubRole::Officer > ClubRole::Member);
    }

    #[test]
    fn enums_parse_their_column_text() {
        assert_eq!("OFFICER".parse::<ClubRole>().unwrap(), ClubRole::Officer);
        assert_eq!(AttendanceStatus::Late.as_str(), "LATE");
        assert!("officer".parse::<ClubRole>().is_err());
    }

    #[test]
    fn enums_serialize_as_column_text() {
        assert_eq!(
            serde_json::to_string(&NotificationKind::JoinReviewed).unwrap(),
            "\"JOIN_REVIEWED\""
        );
        let status: AttendanceStatus = serde_json::from_str("\"EXCUSED\"").unwrap();
        assert_eq!(status, AttendanceStatus::Excused);
    }

    #[test]
    fn only_pending_requests_can_be_reviewed() {
        assert_eq!(
            RequestStatus::Pending.review(true),
            Some(RequestStatus::Approved)
        );
        assert_eq!(
            RequestStatus::Pending.review(false),
            Some(RequestStatus::Rejected)
        );
        assert_eq!(RequestStatus::Approved.review(false), None);
        assert_eq!(RequestStatus::Rejected.review(true), None);
    }

    #[test]
    fn only_open_reports_can_be_closed() {
        assert_eq!(ReportStatus::Open.close(false), Some(ReportStatus::Dismissed));
        assert_eq!(ReportStatus::Resolved.close(true), None);
    }
}
