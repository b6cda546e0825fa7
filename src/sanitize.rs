//! 입력 살균
//!
//! 원격에서 받은 파일명과 장치 이름은 신뢰하지 않는다.
//! 살균 결과만이 디스크 경로의 구성 요소가 된다.

/// Windows 예약 장치 이름
const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// 파일명 최대 길이 (바이트)
const MAX_NAME_BYTES: usize = 240;

/// 길이 제한 시 보존할 확장자 최대 길이 (바이트)
const MAX_EXT_BYTES: usize = 10;

/// 원격에서 받은 파일명 살균
///
/// - 경로 구분자 `/`, `\`로 분해, `.`/`..`/빈 요소는 버리고 `_`로 연결
/// - NUL과 제어 문자(< 32)는 제거
/// - `< > : " | ? *`는 `_`로 치환
/// - 선행/후행 `.`와 공백 제거
/// - Windows 예약어는 `_` 접두
/// - 240바이트로 제한 (10바이트 이하 확장자는 보존)
/// - 결과가 비거나 `.`/`..`이면 `"unnamed"`
pub fn sanitize_filename(filename: &str) -> String {
    if filename.is_empty() {
        return "unnamed".to_string();
    }

    // 경로 구성 요소로 분해. 상위 디렉터리 참조는 탈출 시도로 보고 버린다.
    let mut joined = String::with_capacity(filename.len());
    for component in filename.split(['/', '\\']) {
        if component.is_empty() || component == "." || component == ".." {
            continue;
        }
        if !joined.is_empty() {
            joined.push('_');
        }
        joined.push_str(component);
    }

    let mut result = String::with_capacity(joined.len());
    for c in joined.chars() {
        if (c as u32) < 32 {
            continue;
        }
        match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => result.push('_'),
            _ => result.push(c),
        }
    }

    // 선행 점과 공백 제거 (숨김 파일, 상대 경로)
    let trimmed = result.trim_start_matches(['.', ' ']);
    // 후행 점과 공백 제거 (Windows 제약)
    let trimmed = trimmed.trim_end_matches(['.', ' ']);
    let mut result = trimmed.to_string();

    // Windows 예약어 확인
    let upper = result.to_uppercase();
    for name in RESERVED_NAMES {
        if upper == name || upper.starts_with(&format!("{name}.")) {
            result.insert(0, '_');
            break;
        }
    }

    // 길이 제한, 짧은 확장자는 보존
    if result.len() > MAX_NAME_BYTES {
        let ext = match result.rfind('.') {
            Some(pos) if result.len() - pos <= MAX_EXT_BYTES => result[pos..].to_string(),
            _ => String::new(),
        };
        let max_base = MAX_NAME_BYTES - ext.len();
        let mut base: String = result[..result.len() - ext.len()].to_string();
        while base.len() > max_base {
            base.pop();
        }
        result = base + &ext;
    }

    if result.is_empty() || result == "." || result == ".." {
        return "unnamed".to_string();
    }

    result
}

/// 표시용 장치 이름 살균
///
/// 영숫자와 ` - _ .`만 허용하고 64바이트로 제한한다.
pub fn sanitize_device_name(name: &str) -> String {
    if name.is_empty() {
        return "Unknown Device".to_string();
    }

    let mut result = String::with_capacity(name.len().min(64));

    for c in name.chars() {
        if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' || c == '.' {
            if result.len() + c.len_utf8() > 64 {
                break;
            }
            result.push(c);
        }
    }

    let result = result.trim().to_string();
    if result.is_empty() {
        "Unknown Device".to_string()
    } else {
        result
    }
}
