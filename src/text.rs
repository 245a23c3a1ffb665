/* ====== Нормализация и похожесть названий ====== */

/// Ключ для сравнения названий: нижний регистр, без лишних пробелов.
pub fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Процент похожести двух строк (0..=100).
/// Общие символы считаются рекурсивно вокруг самой длинной общей подстроки,
/// результат: 2 * common / (len_a + len_b) * 100.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 0.0;
    }
    (common_chars(&a, &b) * 2) as f64 * 100.0 / total as f64
}

fn common_chars(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let (pos_a, pos_b, max) = longest_common_run(a, b);
    if max == 0 {
        return 0;
    }
    max + common_chars(&a[..pos_a], &b[..pos_b])
        + common_chars(&a[pos_a + max..], &b[pos_b + max..])
}

// первая (самая левая) из самых длинных общих подстрок
fn longest_common_run(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let (mut pos_a, mut pos_b, mut max) = (0, 0, 0);
    for i in 0..a.len() {
        for j in 0..b.len() {
            let mut k = 0;
            while i + k < a.len() && j + k < b.len() && a[i + k] == b[j + k] {
                k += 1;
            }
            if k > max {
                pos_a = i;
                pos_b = j;
                max = k;
            }
        }
    }
    (pos_a, pos_b, max)
}
