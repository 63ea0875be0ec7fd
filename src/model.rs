use serde::{Deserialize, Serialize};

/// Declares a closed set of stored/wire values. Each variant carries its
/// canonical storage string and a human label for report headers.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => ($wire:literal, $label:literal)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            #[allow(dead_code)]
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }

            #[allow(dead_code)]
            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            /// Case-insensitive; accepts the storage string only.
            pub fn parse(s: &str) -> Option<Self> {
                let t = s.trim();
                $(
                    if t.eq_ignore_ascii_case($wire) {
                        return Some($name::$variant);
                    }
                )+
                None
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let s = value.as_str()?;
                $name::parse(s).ok_or_else(|| {
                    rusqlite::types::FromSqlError::Other(
                        format!("unknown {} value: {}", stringify!($name), s).into(),
                    )
                })
            }
        }
    };
}

wire_enum! {
    /// Curriculum tier. Gates which grade scale and which subjects apply.
    pub enum EducationLevel {
        OLevel => ("OLevel", "O-Level"),
        ALevel => ("ALevel", "A-Level"),
    }
}

wire_enum! {
    pub enum Stream {
        NotApplicable => ("NotApplicable", "Not Applicable"),
        Science => ("Science", "Science/STEM"),
        Arts => ("Arts", "Arts/Humanities"),
        Business => ("Business", "Business/Commerce"),
        Technical => ("Technical", "Technical"),
    }
}

wire_enum! {
    pub enum Term {
        Term1 => ("Term1", "Term 1"),
        Term2 => ("Term2", "Term 2"),
        Term3 => ("Term3", "Term 3"),
        Semester1 => ("Semester1", "Semester 1"),
        Semester2 => ("Semester2", "Semester 2"),
        Annual => ("Annual", "Annual"),
    }
}

wire_enum! {
    pub enum AssessmentType {
        ContinuousAssessment => ("ContinuousAssessment", "Continuous Assessment"),
        MidtermExam => ("MidtermExam", "Mid-Term Exam"),
        FinalExam => ("FinalExam", "Final Exam"),
        MockExam => ("MockExam", "Mock Exam"),
        UceExam => ("UceExam", "UCE (O-Level Final)"),
        UaceExam => ("UaceExam", "UACE (A-Level Final)"),
        ProjectWork => ("ProjectWork", "Project Work"),
        PracticalAssessment => ("PracticalAssessment", "Practical Assessment"),
        Coursework => ("Coursework", "Coursework"),
    }
}

wire_enum! {
    /// Lifecycle of a performance record. Assignments are caller-driven;
    /// no transition graph is enforced.
    pub enum ResultStatus {
        Draft => ("Draft", "Draft"),
        Submitted => ("Submitted", "Submitted"),
        Approved => ("Approved", "Approved"),
        Published => ("Published", "Published"),
        Pending => ("Pending", "Pending Assessment"),
        Incomplete => ("Incomplete", "Incomplete"),
        Result1Qualified => ("Result1Qualified", "Result 1 - Qualifies for Certificate"),
        Result2NotQualified => ("Result2NotQualified", "Result 2 - Does Not Qualify (Missing Requirements)"),
        Result3BelowBasic => ("Result3BelowBasic", "Result 3 - Below Basic Competency"),
    }
}

wire_enum! {
    pub enum SubjectType {
        Compulsory => ("Compulsory", "Compulsory"),
        Elective => ("Elective", "Elective"),
        Optional => ("Optional", "Optional"),
    }
}

wire_enum! {
    pub enum QualificationLevel {
        Certificate => ("Certificate", "Certificate"),
        Diploma => ("Diploma", "Diploma"),
        BachelorsDegree => ("BachelorsDegree", "Bachelor's Degree"),
        MastersDegree => ("MastersDegree", "Master's Degree"),
        PhD => ("PhD", "PhD/Doctorate"),
        ProfessionalCertificate => ("ProfessionalCertificate", "Professional Certificate"),
        Other => ("Other", "Other"),
    }
}

wire_enum! {
    pub enum EnrollmentStatus {
        Active => ("Active", "Active"),
        Dropped => ("Dropped", "Dropped"),
        Completed => ("Completed", "Completed"),
    }
}

wire_enum! {
    pub enum AttendanceStatus {
        Present => ("Present", "Present"),
        Absent => ("Absent", "Absent"),
        Late => ("Late", "Late"),
        Excused => ("Excused", "Excused"),
    }
}

impl AttendanceStatus {
    /// Late arrivals count as attended.
    pub fn counts_as_present(self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::Late)
    }
}
