use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

/// Florence-2 tasks. Each one is selected by its task token, e.g. `<OD>`, and
/// can also be parsed from its kebab-case name, e.g. `od`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(ascii_case_insensitive)]
#[serde(into = "String", try_from = "String")]
pub enum Task {
    #[strum(to_string = "<CAPTION>", serialize = "caption")]
    Caption,
    #[strum(to_string = "<DETAILED_CAPTION>", serialize = "detailed-caption")]
    DetailedCaption,
    #[strum(to_string = "<MORE_DETAILED_CAPTION>", serialize = "more-detailed-caption")]
    MoreDetailedCaption,
    #[strum(to_string = "<OCR>", serialize = "ocr")]
    Ocr,
    #[strum(to_string = "<OCR_WITH_REGION>", serialize = "ocr-with-region")]
    OcrWithRegion,
    #[strum(to_string = "<OD>", serialize = "od")]
    ObjectDetection,
    #[strum(to_string = "<DENSE_REGION_CAPTION>", serialize = "dense-region-caption")]
    DenseRegionCaption,
    #[strum(to_string = "<REGION_PROPOSAL>", serialize = "region-proposal")]
    RegionProposal,
    #[strum(
        to_string = "<CAPTION_TO_PHRASE_GROUNDING>",
        serialize = "caption-to-phrase-grounding"
    )]
    CaptionToPhraseGrounding,
    #[strum(
        to_string = "<REFERRING_EXPRESSION_SEGMENTATION>",
        serialize = "referring-expression-segmentation"
    )]
    ReferringExpressionSegmentation,
    #[strum(to_string = "<REGION_TO_SEGMENTATION>", serialize = "region-to-segmentation")]
    RegionToSegmentation,
    #[strum(
        to_string = "<OPEN_VOCABULARY_DETECTION>",
        serialize = "open-vocabulary-detection"
    )]
    OpenVocabularyDetection,
    #[strum(to_string = "<REGION_TO_CATEGORY>", serialize = "region-to-category")]
    RegionToCategory,
    #[strum(to_string = "<REGION_TO_DESCRIPTION>", serialize = "region-to-description")]
    RegionToDescription,
    #[strum(to_string = "<REGION_TO_OCR>", serialize = "region-to-ocr")]
    RegionToOcr,
}

/// Shape of the structured answer a task produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    PureText,
    Ocr,
    DescriptionWithBboxes { allow_empty_label: bool },
    PhraseGrounding,
    Polygons,
    BboxesOrPolygons,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {0} requires a text input")]
    MissingInput(Task),

    #[error("task {0} does not take a text input")]
    UnexpectedInput(Task),
}

impl From<Task> for String {
    fn from(task: Task) -> Self {
        task.to_string()
    }
}

impl TryFrom<String> for Task {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Task {
    fn template(&self) -> &'static str {
        match self {
            Task::Caption => "What does this image describe?",
            Task::DetailedCaption => "Describe in detail what is shown in the image.",
            Task::MoreDetailedCaption => "Describe with a paragraph what is shown in the image.",
            Task::Ocr => "What is the text in the image?",
            Task::OcrWithRegion => "What is the text in the image, with regions?",
            Task::ObjectDetection => "Locate the objects with category name in the image.",
            Task::DenseRegionCaption => "Locate the objects in the image, with their descriptions.",
            Task::RegionProposal => "Locate the region proposals in the image.",
            Task::CaptionToPhraseGrounding => "Locate the phrases in the caption: {input}",
            Task::ReferringExpressionSegmentation => "Locate {input} in the image with mask",
            Task::RegionToSegmentation => "What is the polygon mask of region {input}",
            Task::OpenVocabularyDetection => "Locate {input} in the image.",
            Task::RegionToCategory => "What is the region {input}?",
            Task::RegionToDescription => "What does the region {input} describe?",
            Task::RegionToOcr => "What text is in the region {input}?",
        }
    }

    pub fn takes_input(&self) -> bool {
        self.template().contains("{input}")
    }

    /// The natural-language prompt fed to the encoder.
    pub fn prompt(&self, text_input: Option<&str>) -> Result<String, TaskError> {
        match (self.takes_input(), text_input) {
            (true, Some(input)) => Ok(self.template().replace("{input}", input)),
            (true, None) => Err(TaskError::MissingInput(*self)),
            (false, None) => Ok(self.template().to_string()),
            (false, Some(_)) => Err(TaskError::UnexpectedInput(*self)),
        }
    }

    pub fn answer_kind(&self) -> AnswerKind {
        match self {
            Task::Caption
            | Task::DetailedCaption
            | Task::MoreDetailedCaption
            | Task::Ocr
            | Task::RegionToCategory
            | Task::RegionToDescription
            | Task::RegionToOcr => AnswerKind::PureText,
            Task::OcrWithRegion => AnswerKind::Ocr,
            Task::ObjectDetection | Task::DenseRegionCaption => {
                AnswerKind::DescriptionWithBboxes {
                    allow_empty_label: false,
                }
            }
            Task::RegionProposal => AnswerKind::DescriptionWithBboxes {
                allow_empty_label: true,
            },
            Task::CaptionToPhraseGrounding => AnswerKind::PhraseGrounding,
            Task::ReferringExpressionSegmentation | Task::RegionToSegmentation => {
                AnswerKind::Polygons
            }
            Task::OpenVocabularyDetection => AnswerKind::BboxesOrPolygons,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_parse_task() {
        assert_eq!(Task::from_str("<OD>").unwrap(), Task::ObjectDetection);
        assert_eq!(Task::from_str("od").unwrap(), Task::ObjectDetection);
        assert_eq!(
            Task::from_str("more-detailed-caption").unwrap(),
            Task::MoreDetailedCaption
        );
        assert_eq!(Task::from_str("<ocr>").unwrap(), Task::Ocr);
        assert!(Task::from_str("<SEGMENT_ANYTHING>").is_err());

        assert_eq!(Task::RegionToOcr.to_string(), "<REGION_TO_OCR>");
    }

    #[test]
    fn test_every_task_round_trips_its_token() {
        assert_eq!(Task::iter().count(), 15);
        for task in Task::iter() {
            let token = task.to_string();
            assert!(token.starts_with('<') && token.ends_with('>'));
            assert_eq!(Task::from_str(&token).unwrap(), task);
        }
    }

    #[test]
    fn test_serde_uses_task_token() {
        let json = serde_json::to_string(&Task::DenseRegionCaption).unwrap();
        assert_eq!(json, r#""<DENSE_REGION_CAPTION>""#);

        let task: Task = serde_json::from_str(r#""region-proposal""#).unwrap();
        assert_eq!(task, Task::RegionProposal);
        assert!(serde_json::from_str::<Task>(r#""nope""#).is_err());
    }

    #[test]
    fn test_prompt() {
        assert_eq!(
            Task::Caption.prompt(None).unwrap(),
            "What does this image describe?"
        );
        assert_eq!(
            Task::CaptionToPhraseGrounding
                .prompt(Some("A green car parked in front of a yellow building."))
                .unwrap(),
            "Locate the phrases in the caption: A green car parked in front of a yellow building."
        );
        assert_eq!(
            Task::RegionToCategory
                .prompt(Some("<loc_52><loc_332><loc_932><loc_774>"))
                .unwrap(),
            "What is the region <loc_52><loc_332><loc_932><loc_774>?"
        );
    }

    #[test]
    fn test_prompt_input_mismatch() {
        assert_eq!(
            Task::OpenVocabularyDetection.prompt(None),
            Err(TaskError::MissingInput(Task::OpenVocabularyDetection))
        );
        assert_eq!(
            Task::ObjectDetection.prompt(Some("car")),
            Err(TaskError::UnexpectedInput(Task::ObjectDetection))
        );
        assert_eq!(
            TaskError::MissingInput(Task::RegionToOcr).to_string(),
            "task <REGION_TO_OCR> requires a text input"
        );
    }

    #[test]
    fn test_answer_kinds() {
        let with_input: Vec<Task> = Task::iter().filter(|t| t.takes_input()).collect();
        assert_eq!(with_input.len(), 7);

        assert_eq!(Task::Ocr.answer_kind(), AnswerKind::PureText);
        assert_eq!(Task::OcrWithRegion.answer_kind(), AnswerKind::Ocr);
        assert_eq!(
            Task::RegionProposal.answer_kind(),
            AnswerKind::DescriptionWithBboxes {
                allow_empty_label: true
            }
        );
        assert_eq!(
            Task::RegionToSegmentation.answer_kind(),
            AnswerKind::Polygons
        );
    }
}
