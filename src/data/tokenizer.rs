//! Turn rendering: chat template + tokenizer
//!
//! The packers only depend on the [`ChatTokenizer`] trait. [`TemplateTokenizer`]
//! is the production implementation, rendering messages through a
//! [`ChatTemplate`] and encoding the text with a HuggingFace `tokenizers`
//! tokenizer.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokenizers::{Encoding, Tokenizer};
use tracing::debug;

use super::conversation::{Message, Role};
use crate::config::SpecialTokens;
use crate::error::{Error, Result};

/// Token ids and attention flags produced for one or more rendered messages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedTurn {
    /// Token ids
    pub input_ids: Vec<u32>,
    /// Attention flags (1 = attend, 0 = padding)
    pub attention_mask: Vec<u32>,
}

impl RenderedTurn {
    /// Create from an encoding
    pub fn from_encoding(encoding: &Encoding) -> Self {
        Self {
            input_ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        }
    }

    /// Number of tokens
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Whether nothing was rendered
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Renders conversational messages into token ids
pub trait ChatTokenizer: Send + Sync {
    /// Render one message or a whole conversation
    fn render(&self, messages: &[Message], add_generation_prompt: bool) -> Result<RenderedTurn>;

    /// Padding token id
    fn pad_token_id(&self) -> u32;

    /// Decode token ids back to text
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;
}

/// Text layout of a chat conversation.
///
/// The defaults follow the GLM-4V layout. `assistant_suffix` must be a single
/// token whose id equals `special_tokens.end_of_turn_token_id`;
/// [`TemplateTokenizer::from_model_dir`] rejects a tokenizer where it is not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatTemplate {
    /// Emitted once at the start of every render call
    pub prefix: String,
    /// Header before a system turn
    pub system_header: String,
    /// Header before a user turn
    pub user_header: String,
    /// Header before an assistant turn
    pub assistant_header: String,
    /// Header before an observation/tool turn
    pub other_header: String,
    /// Emitted after every assistant turn; must tokenize to the end-of-turn token
    pub assistant_suffix: String,
    /// Inserted in front of a content part that carries an image
    pub image_placeholder: String,
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self {
            prefix: "[gMASK]<sop>".to_string(),
            system_header: "<|system|>\n".to_string(),
            user_header: "<|user|>\n".to_string(),
            assistant_header: "<|assistant|>\n".to_string(),
            other_header: "<|observation|>\n".to_string(),
            assistant_suffix: "<|end_of_turn|>".to_string(),
            image_placeholder: "<|begin_of_image|><|endoftext|><|end_of_image|>".to_string(),
        }
    }
}

impl ChatTemplate {
    fn header(&self, role: Role) -> &str {
        match role {
            Role::System => &self.system_header,
            Role::User => &self.user_header,
            Role::Assistant => &self.assistant_header,
            Role::Other => &self.other_header,
        }
    }

    /// Render messages to text
    pub fn apply(&self, messages: &[Message], add_generation_prompt: bool) -> String {
        let mut text = self.prefix.clone();

        for message in messages {
            text.push_str(self.header(message.role));
            for part in message.parts() {
                if part.image.is_some() {
                    text.push_str(&self.image_placeholder);
                }
                if let Some(part_text) = &part.text {
                    text.push_str(part_text);
                }
            }
            if message.role == Role::Assistant {
                text.push_str(&self.assistant_suffix);
            }
        }

        if add_generation_prompt {
            text.push_str(&self.assistant_header);
        }

        text
    }
}

/// Chat tokenizer backed by a `tokenizers` tokenizer and a [`ChatTemplate`]
pub struct TemplateTokenizer {
    tokenizer: Tokenizer,
    template: ChatTemplate,
    pad_token_id: u32,
}

impl TemplateTokenizer {
    /// Wrap a tokenizer.
    ///
    /// The pad id is taken from `pad_override`, otherwise from well-known pad
    /// token names, falling back to common end-of-text tokens.
    pub fn new(tokenizer: Tokenizer, template: ChatTemplate, pad_override: Option<u32>) -> Result<Self> {
        let pad_token_id = match pad_override {
            Some(id) => id,
            None => ["<pad>", "[PAD]", "<|pad|>", "<|endoftext|>", "</s>", "<unk>"]
                .iter()
                .find_map(|token| tokenizer.token_to_id(token))
                .ok_or_else(|| Error::tokenizer("Tokenizer has no pad token; set special_tokens.pad_token_id"))?,
        };
        debug!("Using pad token id {}", pad_token_id);

        Ok(Self {
            tokenizer,
            template,
            pad_token_id,
        })
    }

    /// Load `tokenizer.json` from a file
    pub fn from_file(path: impl AsRef<Path>, template: ChatTemplate, pad_override: Option<u32>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(|e| Error::tokenizer(format!("Failed to load tokenizer: {}", e)))?;
        Self::new(tokenizer, template, pad_override)
    }

    /// Load `<model_dir>/tokenizer.json` and check it against the configured special tokens
    pub fn from_model_dir(
        model_dir: impl AsRef<Path>,
        template: ChatTemplate,
        special_tokens: &SpecialTokens,
    ) -> Result<Self> {
        let tokenizer = Self::from_file(
            model_dir.as_ref().join("tokenizer.json"),
            template,
            special_tokens.pad_token_id,
        )?;
        tokenizer.check_special_tokens(special_tokens)?;
        Ok(tokenizer)
    }

    /// Ensure the template's end-of-turn text is the configured end-of-turn token.
    ///
    /// Evaluation splitting cuts at `end_of_turn_token_id`; a template whose
    /// suffix encodes to anything else would yield no cuts at all.
    pub fn check_special_tokens(&self, special_tokens: &SpecialTokens) -> Result<()> {
        let suffix = &self.template.assistant_suffix;
        match self.token_to_id(suffix) {
            Some(id) if id == special_tokens.end_of_turn_token_id => {
                debug!("End-of-turn '{}' has id {}", suffix, id);
                Ok(())
            }
            Some(id) => Err(Error::tokenizer(format!(
                "Template end-of-turn '{}' has id {} but special_tokens.end_of_turn_token_id is {}",
                suffix, id, special_tokens.end_of_turn_token_id
            ))),
            None => Err(Error::tokenizer(format!(
                "Template end-of-turn '{}' is not a single token of this tokenizer; set template.assistant_suffix",
                suffix
            ))),
        }
    }

    /// Look up a token id
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// Vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Chat template in use
    pub fn template(&self) -> &ChatTemplate {
        &self.template
    }
}

impl ChatTokenizer for TemplateTokenizer {
    fn render(&self, messages: &[Message], add_generation_prompt: bool) -> Result<RenderedTurn> {
        let text = self.template.apply(messages, add_generation_prompt);
        let encoding = self
            .tokenizer
            .encode(text.as_str(), false)
            .map_err(|e| Error::tokenizer(format!("Encoding failed: {}", e)))?;
        Ok(RenderedTurn::from_encoding(&encoding))
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::tokenizer(format!("Decoding failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::conversation::Message;

    fn special(id: u32, content: &str) -> String {
        format!(
            r#"{{"id": {id}, "content": "{content}", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}}"#
        )
    }

    /// `tokenizer.json` of a word-level tokenizer with the template's special tokens registered
    fn word_level_json() -> String {
        let specials = [
            (0, "<pad>"),
            (1, "[gMASK]"),
            (2, "<sop>"),
            (3, "<|system|>"),
            (4, "<|user|>"),
            (5, "<|assistant|>"),
            (6, "<|observation|>"),
            (7, "<|end_of_turn|>"),
            (8, "<|begin_of_image|>"),
            (9, "<|endoftext|>"),
            (10, "<|end_of_image|>"),
        ];
        let words = ["[UNK]", "You", "are", "helpful", "Hi", "Hello", "!", "What", "is", "this", "?", "A", "cat", "."];

        let mut vocab: Vec<String> = specials
            .iter()
            .map(|(id, token)| format!(r#""{}": {}"#, token, id))
            .collect();
        vocab.extend(
            words
                .iter()
                .enumerate()
                .map(|(i, w)| format!(r#""{}": {}"#, w, 100 + i)),
        );

        let added: Vec<String> = specials.iter().map(|(id, token)| special(*id, token)).collect();
        let json = format!(
            r#"{{
                "version": "1.0",
                "truncation": null,
                "padding": null,
                "added_tokens": [{}],
                "normalizer": null,
                "pre_tokenizer": {{"type": "Whitespace"}},
                "post_processor": null,
                "decoder": null,
                "model": {{"type": "WordLevel", "vocab": {{{}}}, "unk_token": "[UNK]"}}
            }}"#,
            added.join(","),
            vocab.join(",")
        );
        json
    }

    fn word_level_tokenizer() -> Tokenizer {
        Tokenizer::from_bytes(word_level_json().as_bytes()).unwrap()
    }

    fn model_dir() -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), word_level_json()).unwrap();
        dir
    }

    /// Special tokens matching the word-level vocabulary
    fn matching_special_tokens() -> SpecialTokens {
        SpecialTokens {
            eos_token_id: 9,
            end_of_turn_token_id: 7,
            pad_token_id: None,
        }
    }

    #[test]
    fn test_template_apply() {
        let template = ChatTemplate::default();
        let messages = vec![Message::user("Hi"), Message::assistant("Hello!")];

        let text = template.apply(&messages, false);
        assert_eq!(
            text,
            "[gMASK]<sop><|user|>\nHi<|assistant|>\nHello!<|end_of_turn|>"
        );

        let prompt = template.apply(&messages[..1], true);
        assert!(prompt.ends_with("<|assistant|>\n"));
    }

    #[test]
    fn test_template_image_placeholder() {
        let template = ChatTemplate::default();
        let text = template.apply(&[Message::user_with_image("cat.png", "What is this?")], false);
        assert!(text.contains("<|user|>\n<|begin_of_image|><|endoftext|><|end_of_image|>What is this?"));
    }

    #[test]
    fn test_render_single_message() {
        let tokenizer = TemplateTokenizer::new(word_level_tokenizer(), ChatTemplate::default(), None).unwrap();
        let rendered = tokenizer.render(&[Message::assistant("Hello!")], false).unwrap();

        // [gMASK] <sop> <|assistant|> Hello ! <|end_of_turn|>
        assert_eq!(rendered.input_ids, vec![1, 2, 5, 105, 106, 7]);
        assert_eq!(rendered.attention_mask, vec![1; 6]);
        assert_eq!(tokenizer.pad_token_id(), 0);
    }

    #[test]
    fn test_pad_override() {
        let tokenizer = TemplateTokenizer::new(word_level_tokenizer(), ChatTemplate::default(), Some(9)).unwrap();
        assert_eq!(tokenizer.pad_token_id(), 9);
    }

    #[test]
    fn test_decode_skips_special_tokens() {
        let tokenizer = TemplateTokenizer::new(word_level_tokenizer(), ChatTemplate::default(), None).unwrap();
        let text = tokenizer.decode(&[5, 105, 7], true).unwrap();
        assert_eq!(text, "Hello");
    }

    #[test]
    fn test_model_dir_rejects_end_of_turn_id_mismatch() {
        let dir = model_dir();
        let result = TemplateTokenizer::from_model_dir(dir.path(), ChatTemplate::default(), &SpecialTokens::default());
        match result {
            Err(Error::Tokenizer(msg)) => assert!(msg.contains("59254")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("mismatched end-of-turn id accepted"),
        }
    }

    #[test]
    fn test_model_dir_rejects_suffix_outside_vocabulary() {
        let dir = model_dir();
        let template = ChatTemplate {
            assistant_suffix: "<|eot|>".to_string(),
            ..ChatTemplate::default()
        };
        let result = TemplateTokenizer::from_model_dir(dir.path(), template, &matching_special_tokens());
        assert!(matches!(result, Err(Error::Tokenizer(_))));
    }

    #[test]
    fn test_matching_end_of_turn_splits_every_exchange() {
        let dir = model_dir();
        let special_tokens = matching_special_tokens();
        let tokenizer =
            TemplateTokenizer::from_model_dir(dir.path(), ChatTemplate::default(), &special_tokens).unwrap();

        let mut options = crate::data::PackingOptions::new(16, 12).unwrap();
        options.eos_token_id = special_tokens.eos_token_id;
        options.end_of_turn_token_id = special_tokens.end_of_turn_token_id;

        let conv = crate::data::Conversation::new(vec![
            Message::user("Hi"),
            Message::assistant("Hello!"),
            Message::user("What is this?"),
            Message::assistant("A cat."),
        ])
        .unwrap();

        let examples = crate::data::split_for_eval(&conv, &tokenizer, &options).unwrap();
        assert_eq!(examples.len(), 2);
        // <|assistant|> Hello ! <|end_of_turn|>
        assert!(examples[0].input_ids.ends_with(&[5, 105, 106, 7]));
        assert_eq!(examples[1].output_ids.last(), Some(&9));
    }
}
