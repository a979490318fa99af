//! Patient record extraction from free medical text.

use model_io_core::parser::{
    FieldDescriptor, FieldType, Schema, StructuredParser, StructuredRecord,
};
use model_io_core::prompt::{
    Example, ExampleSelector, FewShotPromptTemplate, PromptError, PromptTemplate,
};
use model_io_core::ParseError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Variable holding the text to extract from.
pub const MEDICAL_TEXT_VAR: &str = "medical_text";

const EXAMPLE_TEMPLATE: &str = "输入：{input}\n输出：{output}";

const PREFIX: &str = "你是医学病历信息抽取专家。\n\
请仅根据 **输入文本** 提取如下字段：\n\n\
- name（患者姓名）\n\
- age（年龄，正整数）\n\
- symptoms（症状，按列表格式列出）\n\
- diagnosis（诊断结果）\n\
- is_urgent（是否紧急，true/false）\n\n\
请严格按照以下格式输出：\n{{ format_instructions }}\n\n\
以下是一些示例：";

const SUFFIX: &str = "现在请从下面的文本中提取字段：\n\n输入：{{ medical_text }}\n输出：";

/// A validated patient record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    /// Patient name.
    pub name: String,
    /// Age in years.
    pub age: u32,
    /// Symptoms, one per item.
    pub symptoms: Vec<String>,
    /// Diagnosis.
    pub diagnosis: String,
    /// Whether the case needs urgent handling.
    #[serde(default)]
    pub is_urgent: bool,
}

impl TryFrom<&StructuredRecord> for PatientRecord {
    type Error = ParseError;

    #[inline]
    fn try_from(record: &StructuredRecord) -> Result<Self, Self::Error> {
        record.deserialize()
    }
}

fn age_must_be_non_negative(value: &Value) -> Result<(), String> {
    match value.as_i64() {
        Some(age) if age >= 0 => Ok(()),
        _ => Err("年龄必须大于0，且为整数".to_owned()),
    }
}

/// Returns the field table of [`PatientRecord`].
pub fn patient_schema() -> Schema {
    Schema::new()
        .with_title("PatientRecord")
        .with_field(FieldDescriptor::required("name", FieldType::String, "患者姓名"))
        .with_field(
            FieldDescriptor::required("age", FieldType::Integer, "患者年龄, 必须是整数")
                .with_validator(age_must_be_non_negative),
        )
        .with_field(FieldDescriptor::required(
            "symptoms",
            FieldType::StringList,
            "患者症状列表，每个症状独立拆分",
        ))
        .with_field(FieldDescriptor::required(
            "diagnosis",
            FieldType::String,
            "患者诊断结果",
        ))
        .with_field(FieldDescriptor::optional(
            "is_urgent",
            FieldType::Boolean,
            "患者是否需要加急处理",
            Some(Value::Bool(false)),
        ))
}

/// Returns a parser for [`PatientRecord`].
#[inline]
pub fn patient_parser() -> StructuredParser {
    StructuredParser::new(patient_schema())
}

/// Returns the worked examples stored in the similarity index.
pub fn patient_examples() -> Vec<Example> {
    vec![
        Example::new(
            "张三，男，四十五岁，主诉胸痛伴呼吸困难，诊断为急性心肌梗死，需立即处理。",
            json!({
                "name": "张三",
                "age": 45,
                "symptoms": ["胸痛", "呼吸困难"],
                "diagnosis": "急性心肌梗死",
                "is_urgent": true,
            }),
        ),
        Example::new(
            "李四，女，二十八岁，咳嗽三天并伴有低烧，诊断为上呼吸道感染。",
            json!({
                "name": "李四",
                "age": 28,
                "symptoms": ["咳嗽", "低烧"],
                "diagnosis": "上呼吸道感染",
                "is_urgent": false,
            }),
        ),
        Example::new(
            "王五，男，六十岁，头痛、视物模糊，血压 180/110，诊断为高血压危象。",
            json!({
                "name": "王五",
                "age": 60,
                "symptoms": ["头痛", "视物模糊"],
                "diagnosis": "高血压危象",
                "is_urgent": true,
            }),
        ),
    ]
}

/// Builds the few-shot extraction prompt around `selector`.
///
/// The selector is expected to look at [`MEDICAL_TEXT_VAR`].
pub fn patient_prompt<S>(
    selector: S,
    parser: &StructuredParser,
) -> Result<FewShotPromptTemplate, PromptError>
where
    S: ExampleSelector + 'static,
{
    Ok(
        FewShotPromptTemplate::new(PromptTemplate::new(EXAMPLE_TEMPLATE)?, selector)
            .with_prefix(PromptTemplate::jinja2(PREFIX)?)
            .with_suffix(PromptTemplate::jinja2(SUFFIX)?)
            .partial("format_instructions", parser.format_instructions()),
    )
}

#[cfg(test)]
mod tests {
    use model_io_core::ModelClient;
    use model_io_core::chain::ExtractionChain;
    use model_io_core::index::DistanceMetric;
    use model_io_core::prompt::{SemanticSimilarityExampleSelector, variables};
    use model_io_test_model::{PresetResponse, TestEmbeddingProvider, TestModelProvider};

    use super::*;

    #[test]
    fn test_examples_are_valid_records() {
        let parser = patient_parser();
        for example in patient_examples() {
            let record = parser.parse(&example.output.to_string()).unwrap();
            PatientRecord::try_from(&record).unwrap();
        }
    }

    #[test]
    fn test_optional_and_invalid_fields() {
        let parser = patient_parser();
        let record = parser
            .parse(r#"{"name": "赵敏", "age": 30, "symptoms": ["头晕", "恶心"], "diagnosis": "低血压"}"#)
            .unwrap();
        let patient = PatientRecord::try_from(&record).unwrap();
        assert!(!patient.is_urgent);

        let err = parser
            .parse(r#"{"name": "无名氏", "age": -1, "symptoms": ["腹痛"], "diagnosis": "急性肠胃炎"}"#)
            .unwrap_err();
        assert!(matches!(err, ParseError::Validation(ref e) if e.field == "age"));
        let err = parser
            .parse(r#"{"name": "无名氏", "symptoms": ["腹痛"], "diagnosis": "急性肠胃炎"}"#)
            .unwrap_err();
        assert!(matches!(err, ParseError::Validation(ref e) if e.field == "age"));
    }

    #[tokio::test]
    async fn test_extraction_prompt() {
        let parser = patient_parser();
        let selector = SemanticSimilarityExampleSelector::from_examples(
            TestEmbeddingProvider::new(16),
            DistanceMetric::Cosine,
            &patient_examples(),
        )
        .await
        .unwrap()
        .with_input_keys([MEDICAL_TEXT_VAR]);
        let prompt = patient_prompt(selector, &parser).unwrap();
        assert_eq!(prompt.input_variables(), [MEDICAL_TEXT_VAR]);

        let provider = TestModelProvider::with_script([PresetResponse::text(
            "```json\n{\"name\": \"赵敏\", \"age\": 30, \"symptoms\": [\"头晕\", \"恶心\"], \"diagnosis\": \"低血压\"}\n```",
        )]);
        let chain = ExtractionChain::new(prompt, ModelClient::new(provider.clone()), parser);
        let record = chain
            .run(&variables([(MEDICAL_TEXT_VAR, "赵敏，女，三十岁，主诉头晕和恶心，诊断为低血压。")]))
            .await
            .unwrap();
        assert_eq!(
            PatientRecord::try_from(&record).unwrap(),
            PatientRecord {
                name: "赵敏".into(),
                age: 30,
                symptoms: vec!["头晕".into(), "恶心".into()],
                diagnosis: "低血压".into(),
                is_urgent: false,
            }
        );

        let requests = provider.requests();
        let prompt_text = requests[0].messages[0].content();
        assert!(prompt_text.starts_with("你是医学病历信息抽取专家。"));
        assert!(prompt_text.contains("\"title\":\"PatientRecord\""));
        // k defaults to one example.
        assert_eq!(prompt_text.matches("输入：").count(), 2);
        assert!(prompt_text.ends_with("输入：赵敏，女，三十岁，主诉头晕和恶心，诊断为低血压。\n输出："));
    }
}
