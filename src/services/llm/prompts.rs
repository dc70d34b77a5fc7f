//! Prompt builders for every LLM call site.
//!
//! Prompts stay in Chinese: the sink platform is Chinese and the compact
//! phrasing keeps token counts down. Each builder returns the `(system,
//! user)` pair; the adapter owns JSON enforcement and decoding.

/// Translation prompt for a title or description.
pub fn translate(text: &str, target_language: &str, is_title: bool) -> (String, String) {
    let purpose = if is_title { "标题" } else { "描述" };
    let system = r#"JSON翻译器。仅输出{"translation":"..."}，无其他内容。"#.to_string();
    let user = format!(
        "翻译视频{}为{}，移除推广信息，返回JSON。\n\n规则：\n1. 移除：URL/邮箱/社交账号/CTA（关注订阅点赞分享等）/联系方式\n2. 等价翻译：不解释、不扩写、保持原意和风格\n3. 保留：数字/代码/专有名词（无固定译名时）\n\n原文：\n{}\n\n返回：{{\"translation\":\"译文\"}}",
        purpose, target_language, text
    );
    (system, user)
}

/// Strict retry used when the first translation came back empty or
/// unchanged.
pub fn translate_strict(text: &str) -> (String, String) {
    let system = r#"仅输出{"translation":"..."}，中文。"#.to_string();
    let user = format!(
        "翻译为简体中文，移除推广信息，仅返回JSON。\n\n原文：{}\n\n返回：{{\"translation\":\"译文\"}}",
        text
    );
    (system, user)
}

/// Tag generation prompt.
pub fn generate_tags(title: &str, short_description: &str) -> (String, String) {
    let system = r#"标签生成器。仅输出{"tags":[...]}格式的6个标签。"#.to_string();
    let user = format!(
        "为视频生成6个标签（每个≤10汉字）。\n\n标题：{}\n描述：{}\n\n返回JSON：{{\"tags\":[\"标签1\",\"标签2\",\"标签3\",\"标签4\",\"标签5\",\"标签6\"]}}",
        title, short_description
    );
    (system, user)
}

/// Category classification prompt over the flattened catalog listing.
pub fn classify_category(title: &str, description: &str, catalog_listing: &str) -> (String, String) {
    let system = r#"视频分区选择器。仅输出{"id":"...","reason":"..."}。"#.to_string();
    let user = format!(
        "从分区列表选择最匹配的分区。\n\n标题：{}\n描述：{}\n\n分区列表：\n{}\n\n返回JSON：{{\"id\":\"分区ID\",\"reason\":\"理由\"}}",
        title, description, catalog_listing
    );
    (system, user)
}

/// Batched subtitle translation prompt.
pub fn translate_subtitle_batch(texts_json: &str, target_language: &str) -> (String, String) {
    let system = format!(
        "字幕翻译器。输入{{\"texts\":[...]}}，输出{{\"translations\":[...]}}，数量与顺序一致，{}。",
        target_language
    );
    let user = format!(
        "翻译以下字幕为{}。保持口语化、简洁，不解释。输入与输出条数必须一致。\n\n{}\n\n返回JSON：{{\"translations\":[...]}}",
        target_language, texts_json
    );
    (system, user)
}

/// Strict subtitle repair prompt that forbids retaining the source text.
pub fn translate_subtitle_strict(texts_json: &str, target_language: &str) -> (String, String) {
    let system = format!(
        "字幕翻译器。必须译为{}，禁止保留原文。仅输出{{\"translations\":[...]}}。",
        target_language
    );
    let user = format!(
        "将以下字幕逐条译为{}。即使不确定也要给出译文，禁止原样返回。条数一致。\n\n{}\n\n返回JSON：{{\"translations\":[...]}}",
        target_language, texts_json
    );
    (system, user)
}

/// Lenient quality-judge prompt over a subtitle sample.
pub fn qc_judge(sample: &str) -> (String, String) {
    let system =
        r#"字幕质量审核员。仅输出{"passed":true/false,"score":0.0,"reason":"..."}。"#.to_string();
    let user = format!(
        "判断以下字幕样本是否可用。宽松标准：只有明显不可用（大量重复、乱码、占位符刷屏）才不通过；普通翻译瑕疵应当通过。\n\n样本：\n{}\n\n返回JSON：{{\"passed\":true,\"score\":0.9,\"reason\":\"...\"}}",
        sample
    );
    (system, user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_prompt_names_kind() {
        let (_, user) = translate("Hello", "zh-CN", true);
        assert!(user.contains("标题"));
        assert!(user.contains("Hello"));
        let (_, user) = translate("Hello", "zh-CN", false);
        assert!(user.contains("描述"));
    }

    #[test]
    fn test_subtitle_prompts_demand_count_parity() {
        let (_, user) = translate_subtitle_batch("{\"texts\":[\"a\"]}", "简体中文");
        assert!(user.contains("条数必须一致"));
        let (system, _) = translate_subtitle_strict("{\"texts\":[\"a\"]}", "简体中文");
        assert!(system.contains("禁止保留原文"));
    }
}
